mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Fixture;
use schemacache::dispatch::Operation;
use schemacache::{
    app, Api, ApiBuilder, ApiRequest, ApiResponse, AppError, AppState, Authorizer, EntityType, JobRunner,
    JobStatusOperation, JobSubmitOperation, JobWork, Session, ValidatedRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Token;

#[async_trait]
impl Authorizer for Token {
    async fn authorize(&self, req: &ApiRequest, _: &mut Session) -> Result<Option<ApiResponse>, AppError> {
        match req.headers.get("authorization").map(String::as_str) {
            Some("Bearer secret") => Ok(None),
            _ => Ok(Some(ApiResponse::json(
                StatusCode::UNAUTHORIZED,
                json!({"message": "invalid token"}),
            ))),
        }
    }
}

struct Explode;

#[async_trait]
impl Operation for Explode {
    async fn call(&self, _: &EntityType, _: ValidatedRequest, _: &mut Session) -> Result<ApiResponse, AppError> {
        panic!("fuse lit")
    }
}

fn api(fx: &Fixture) -> Api {
    let jobs = JobRunner::new(fx.cache.clone());
    let reindex = JobSubmitOperation::new(jobs.clone(), |entity, _| {
        let key = entity.key.clone();
        Ok(JobWork::suspendable(move |session| {
            Box::pin(async move {
                let registry = session.registry().clone();
                let Some(entity) = registry.by_key(&key) else {
                    return Err(AppError::Unexpected(format!("unknown entity {}", key)));
                };
                let all = schemacache::model::get(session, entity, Default::default()).await?;
                Ok(json!({ "reindexed": all.len() }))
            })
        }))
    });
    ApiBuilder::new(fx.registry.clone(), fx.backends.clone())
        .title("stores")
        .version("1.0")
        .authorizer(Arc::new(Token))
        .operation("store", "reindex", Arc::new(reindex))
        .operation("store", "reindex_status", Arc::new(JobStatusOperation::new(jobs)))
        .operation("store", "explode", Arc::new(Explode))
        .build()
        .expect("api")
}

fn with_path(method: &str, path: &str) -> ApiRequest {
    ApiRequest::new(method, path)
}

#[tokio::test]
async fn crud_through_the_dispatcher() {
    let fx = Fixture::new();
    let api = api(&fx);

    let resp = api
        .dispatch(with_path("POST", "/stores").with_json(&json!([{"name": "downtown"}])))
        .await;
    assert_eq!(resp.status, StatusCode::CREATED);
    let created = json!({"id": 1, "name": "downtown", "items": [], "tags": []});
    assert_eq!(resp.body, Some(json!([created.clone()])));

    let resp = api.dispatch(with_path("GET", "/stores/1")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body, Some(created));

    let resp = api.dispatch(with_path("GET", "/stores/9/")).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(resp.body, None);

    let resp = api
        .dispatch(with_path("PATCH", "/stores/1").with_json(&json!({"name": "uptown"})))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.expect("body")["name"], json!("uptown"));

    let resp = api.dispatch(with_path("GET", "/stores").with_query("name", "uptown")).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.expect("body").as_array().map(Vec::len), Some(1));

    let resp = api
        .dispatch(with_path("DELETE", "/stores/1").with_header("Authorization", "Bearer secret"))
        .await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    assert_eq!(api.dispatch(with_path("GET", "/stores/1")).await.status, StatusCode::NOT_FOUND);
    assert_eq!(fx.cached("store", "1").await, None);
}

#[tokio::test]
async fn authorizer_short_circuits_before_validation() {
    let fx = Fixture::new();
    let api = api(&fx);
    api.dispatch(with_path("POST", "/stores").with_json(&json!([{"name": "a"}])))
        .await;

    let resp = api.dispatch(with_path("DELETE", "/stores/not-a-number")).await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(resp.body, Some(json!({"message": "invalid token"})));

    let resp = api
        .dispatch(with_path("DELETE", "/stores/1").with_header("Authorization", "Bearer nope"))
        .await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    assert_eq!(fx.store.rows("store").len(), 1);
}

#[tokio::test]
async fn failures_map_to_error_bodies() {
    let fx = Fixture::new();
    let api = api(&fx);
    api.dispatch(with_path("POST", "/stores").with_json(&json!([{"id": 1, "name": "a"}])))
        .await;

    let resp = api
        .dispatch(with_path("PATCH", "/stores/1").with_json(&json!({"name": 5})))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let body = resp.body.expect("body");
    assert_eq!(body["instance"], json!(5));
    let message = body["message"].as_str().expect("message");
    assert!(message.contains("Failed validating instance['name']"), "{}", message);

    let resp = api.dispatch(with_path("GET", "/stores/x")).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.body.expect("body")["message"],
        json!("invalid value 'x' for type 'integer'")
    );

    let mut no_type = with_path("POST", "/stores");
    no_type.body = Some(br#"[{"name": "x"}]"#.to_vec());
    let resp = api.dispatch(no_type).await;
    assert_eq!(
        resp.body,
        Some(json!({"message": "Request content_type is missing", "instance": [{"name": "x"}]}))
    );

    let input = json!([{"name": "b", "items": [{"_operation": "fly"}]}]);
    let resp = api.dispatch(with_path("POST", "/stores").with_json(&input)).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.body,
        Some(json!({"message": "Invalid nested operation \"fly\"", "instance": input}))
    );

    let resp = api
        .dispatch(with_path("POST", "/stores").with_json(&json!([{"id": 1, "name": "again"}])))
        .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    let body = resp.body.expect("body");
    assert_eq!(body["database message"]["code"], json!("23505"));
    assert_eq!(body["params"], json!({"id": 1, "name": "again"}));

    let resp = api.dispatch(with_path("POST", "/stores/explode")).await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.body, Some(json!({"message": "Something unexpected happened"})));
}

#[tokio::test]
async fn unknown_methods_and_options() {
    let fx = Fixture::new();
    let api = api(&fx);

    let resp = api.dispatch(with_path("PUT", "/stores")).await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.header("allow"), Some("GET, OPTIONS, POST"));

    let resp = api.dispatch(with_path("OPTIONS", "/stores/1")).await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    assert_eq!(resp.header("allow"), Some("DELETE, GET, PATCH"));

    assert_eq!(api.dispatch(with_path("GET", "/nowhere")).await.status, StatusCode::NOT_FOUND);
    let options = &api.swagger_json()["paths"]["/stores/{id}"]["options"];
    assert_eq!(options["operationId"], json!("options_stores_id"));
}

#[tokio::test]
async fn jobs_run_in_the_background() {
    let fx = Fixture::new();
    let api = api(&fx);
    api.dispatch(with_path("POST", "/stores").with_json(&json!([{"name": "a"}, {"name": "b"}])))
        .await;

    let resp = api.dispatch(with_path("POST", "/stores/reindex")).await;
    assert_eq!(resp.status, StatusCode::CREATED);
    let hash = resp.body.expect("body")["job_hash"]
        .as_str()
        .expect("job hash")
        .to_string();

    let mut record = Value::Null;
    for _ in 0..200 {
        let resp = api
            .dispatch(with_path("GET", "/stores/reindex").with_query("job_hash", &hash))
            .await;
        assert_eq!(resp.status, StatusCode::OK);
        record = resp.body.expect("body");
        if record["status"] != json!("running") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(record["status"], json!("done"));
    assert_eq!(record["result"], json!({"reindexed": 2}));

    let resp = api
        .dispatch(with_path("GET", "/stores/reindex").with_query("job_hash", "missing"))
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cache_entities_search_over_http() {
    let fx = Fixture::new();
    let api = api(&fx);
    let cars = json!([{"id": 1, "model": "beetle"}, {"id": 2, "model": "kombi"}]);
    let resp = api.dispatch(with_path("POST", "/cars").with_json(&cars)).await;
    assert_eq!(resp.status, StatusCode::CREATED);

    let search = || with_path("GET", "/cars/search").with_query("pattern", "kombi");
    let first = api.dispatch(search()).await;
    let second = api.dispatch(search()).await;
    assert_eq!(first.body, Some(json!([{"id": 2, "model": "kombi"}])));
    assert_eq!(first, second);

    let resp = api
        .dispatch(with_path("GET", "/cars/search").with_query("pattern", "nothing"))
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

async fn read_json(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn axum_router_serves_declared_paths() {
    let fx = Fixture::new();
    let router = app(AppState::new(api(&fx)), 1024 * 1024);

    let resp = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stores/")
                .header("content-type", "application/json")
                .body(Body::from(r#"[{"name": "downtown"}]"#))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(read_json(resp).await[0]["id"], json!(1));

    let resp = router
        .clone()
        .oneshot(Request::builder().uri("/stores/1").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        read_json(resp).await,
        json!({"id": 1, "name": "downtown", "items": [], "tags": []})
    );

    let resp = router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(read_json(resp).await, json!({"status": "ok"}));

    let resp = router
        .clone()
        .oneshot(Request::builder().uri("/doc/swagger.json").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router
        .oneshot(
            Request::builder()
                .uri("/doc/swagger.json")
                .header("authorization", "Bearer secret")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let doc = read_json(resp).await;
    assert_eq!(doc["info"]["title"], json!("stores"));
    assert!(doc["paths"]["/stores/{id}"]["get"].is_object());
}

struct Tripwire;

#[async_trait]
impl Authorizer for Tripwire {
    async fn authorize(&self, _: &ApiRequest, _: &mut Session) -> Result<Option<ApiResponse>, AppError> {
        panic!("token store offline")
    }
}

#[tokio::test]
async fn panicking_authorizer_is_an_unexpected_error() {
    let fx = Fixture::new();
    let api = ApiBuilder::new(fx.registry.clone(), fx.backends.clone())
        .authorizer(Arc::new(Tripwire))
        .operation("store", "explode", Arc::new(Explode))
        .operation("store", "reindex", Arc::new(Explode))
        .operation("store", "reindex_status", Arc::new(Explode))
        .build()
        .expect("api");

    let req = with_path("GET", "/stores").with_header("Authorization", "Bearer secret");
    let resp = api.dispatch(req).await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);

    let resp = api.doc(&with_path("GET", "/doc/swagger.json")).await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);

    let resp = api
        .dispatch(with_path("POST", "/stores").with_json(&json!([{"name": "downtown"}])))
        .await;
    assert_eq!(resp.status, StatusCode::CREATED);
}
