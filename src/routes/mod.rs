//! axum adapter: one route per declared path, converted to and from the dispatcher's
//! request/response envelope.

use crate::response::ApiRequest;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

static TEMPLATE_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}/]+)\}").unwrap());

/// `/cars/{id}` -> `/cars/:id`
pub fn axum_path(template: &str) -> String {
    TEMPLATE_PARAM.replace_all(template, ":$1").into_owned()
}

/// Decode the transport request. Repeated query keys are joined with commas and
/// header names are lowercase.
pub fn to_api_request(
    method: &Method,
    uri: &Uri,
    path_params: HashMap<String, String>,
    query: Vec<(String, String)>,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiRequest {
    let mut req = ApiRequest::new(method.as_str(), uri.path());
    req.path_params = path_params;
    for (name, value) in query {
        req.query
            .entry(name)
            .and_modify(|v| {
                v.push(',');
                v.push_str(&value);
            })
            .or_insert(value);
    }
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            tracing::debug!(header = %name, "skipping non-text header");
            continue;
        };
        req.headers
            .entry(name.as_str().to_lowercase())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    req.body = if body.is_empty() { None } else { Some(body.to_vec()) };
    req
}

/// Routes for every declared path (with and without trailing slash) plus the
/// published document.
pub fn api_routes(state: AppState) -> Router {
    let mut router = Router::new();
    for (idx, route) in state.api.routes().iter().enumerate() {
        let handler = move |State(state): State<AppState>,
                            params: Option<Path<HashMap<String, String>>>,
                            method: Method,
                            uri: Uri,
                            Query(query): Query<Vec<(String, String)>>,
                            headers: HeaderMap,
                            body: Bytes| async move {
            let params = params.map(|Path(p)| p).unwrap_or_default();
            let req = to_api_request(&method, &uri, params, query, &headers, body);
            state.api.call(idx, req).await
        };
        let path = axum_path(route.path());
        if path != "/" {
            router = router.route(&format!("{}/", path), any(handler.clone()));
        }
        router = router.route(&path, any(handler));
    }
    let doc_path = state.api.doc_path();
    router
        .route(&doc_path, get(doc))
        .with_state(state)
}

async fn doc(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Response {
    let req = to_api_request(&method, &uri, HashMap::new(), query, &headers, Bytes::new());
    state.api.doc(&req).await.into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health, GET /version.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// The full application: declared API, common routes, body limit and request tracing.
pub fn app(state: AppState, max_body_bytes: usize) -> Router {
    api_routes(state)
        .merge(common_routes())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_paths_become_axum_paths() {
        assert_eq!(axum_path("/cars/{id}/parts/{part_id}"), "/cars/:id/parts/:part_id");
        assert_eq!(axum_path("/cars"), "/cars");
    }

    #[test]
    fn repeated_query_keys_join_with_commas() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Trace", "abc".parse().unwrap());
        let req = to_api_request(
            &Method::GET,
            &"/cars?id=1&id=2".parse().unwrap(),
            HashMap::new(),
            vec![("id".into(), "1".into()), ("id".into(), "2".into())],
            &headers,
            Bytes::new(),
        );
        assert_eq!(req.method, "get");
        assert_eq!(req.path, "/cars");
        assert_eq!(req.query["id"], "1,2");
        assert_eq!(req.headers["x-trace"], "abc");
        assert!(req.body.is_none());
    }
}
