//! Assembly of every entity's declared paths into one dispatchable API.

use super::{panic_message, AllowOperation, Authorizer, MethodHandler, Operation, StandardOperation};
use crate::error::{AppError, ConfigError};
use crate::model::{EntityId, EntityType, Registry};
use crate::response::{ApiRequest, ApiResponse};
use crate::session::{Backends, Session};
use crate::validation::{merge_parameters, MethodValidator};
use axum::http::StatusCode;
use futures_util::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub const HTTP_METHODS: [&str; 7] = ["delete", "get", "head", "options", "patch", "post", "put"];

static PATH_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}/]+)\}").unwrap());

/// One templated path (`/cars/{id}`) and its declared methods.
pub struct Route {
    path: String,
    pattern: Regex,
    params: Vec<String>,
    pub entity: EntityId,
    methods: BTreeMap<String, MethodHandler>,
}

impl Route {
    fn new(path: String, entity: EntityId, methods: BTreeMap<String, MethodHandler>) -> Result<Self, ConfigError> {
        let mut pattern = String::from("^");
        let mut params = Vec::new();
        let mut last = 0;
        for cap in PATH_PARAM.captures_iter(&path) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            pattern.push_str(&regex::escape(&path[last..whole.start()]));
            pattern.push_str("([^/]+)");
            params.push(name.as_str().to_string());
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&path[last..]));
        pattern.push_str("/?$");
        let pattern = Regex::new(&pattern).map_err(|e| ConfigError::InvalidSchema(format!("path {}: {}", path, e)))?;
        Ok(Route {
            path,
            pattern,
            params,
            entity,
            methods,
        })
    }

    /// Full templated path, base path included, without trailing slash.
    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn handler(&self, method: &str) -> Option<&MethodHandler> {
        self.methods.get(method)
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.pattern.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .filter_map(|(i, name)| caps.get(i + 1).map(|m| (name.clone(), m.as_str().to_string())))
                .collect(),
        )
    }

    fn allow(&self) -> String {
        self.methods.keys().map(|m| m.to_uppercase()).collect::<Vec<_>>().join(", ")
    }
}

pub struct ApiBuilder {
    registry: Arc<Registry>,
    backends: Backends,
    title: Option<String>,
    version: Option<String>,
    base_path: String,
    template: Option<Value>,
    authorizer: Option<Arc<dyn Authorizer>>,
    authorize_doc: bool,
    operations: HashMap<(String, String), Arc<dyn Operation>>,
}

impl ApiBuilder {
    pub fn new(registry: Arc<Registry>, backends: Backends) -> Self {
        ApiBuilder {
            registry,
            backends,
            title: None,
            version: None,
            base_path: String::new(),
            template: None,
            authorizer: None,
            authorize_doc: true,
            operations: HashMap::new(),
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into().trim_end_matches('/').to_string();
        self
    }

    /// A complete document template used instead of `title`/`version`. Its `paths` must be empty.
    pub fn template(mut self, template: Value) -> Self {
        self.template = Some(template);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Whether the document route goes through the authorizer (default true).
    pub fn authorize_doc(mut self, authorize: bool) -> Self {
        self.authorize_doc = authorize;
        self
    }

    /// Bind `operation_id` on `entity_key` to a custom operation. Takes precedence over
    /// the standard operations.
    pub fn operation(mut self, entity_key: &str, operation_id: &str, operation: Arc<dyn Operation>) -> Self {
        self.operations
            .insert((entity_key.to_string(), operation_id.to_string()), operation);
        self
    }

    fn resolve(&self, entity: &EntityType, operation_id: &str) -> Option<Arc<dyn Operation>> {
        let name = operation_id.rsplit('.').next().unwrap_or(operation_id);
        if let Some(op) = self.operations.get(&(entity.key.clone(), name.to_string())) {
            return Some(op.clone());
        }
        name.parse::<StandardOperation>()
            .ok()
            .map(|op| Arc::new(op) as Arc<dyn Operation>)
    }

    fn document(&self) -> Result<Value, ConfigError> {
        let mut doc = match (&self.template, &self.title) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(ConfigError::InvalidSchema(
                    "One of 'title' or 'template' must be set".into(),
                ))
            }
            (Some(_), None) if self.version.is_some() => {
                return Err(ConfigError::InvalidSchema(
                    "'version' can't be set together with 'template'".into(),
                ))
            }
            (Some(template), None) => template.clone(),
            (None, Some(title)) => json!({
                "swagger": "2.0",
                "info": {
                    "title": title,
                    "version": self.version.clone().unwrap_or_else(|| "1.0.0".into())
                }
            }),
        };
        if doc.get("paths").and_then(Value::as_object).is_some_and(|p| !p.is_empty()) {
            return Err(ConfigError::InvalidSchema(
                "the document 'paths' are populated from the entities and must be empty".into(),
            ));
        }
        if !self.base_path.is_empty() {
            doc["basePath"] = Value::String(self.base_path.clone());
        }
        Ok(doc)
    }

    pub fn build(self) -> Result<Api, ConfigError> {
        let mut doc = self.document()?;
        let mut definitions: Map<String, Value> = doc
            .get("definitions")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut paths = Map::new();
        let mut routes = Vec::new();

        for entity in self.registry.iter() {
            let Some(api) = &entity.api else {
                continue;
            };
            for (name, definition) in &api.definitions {
                if definitions.insert(name.clone(), definition.clone()).is_some() {
                    return Err(ConfigError::DuplicateDefinition(name.clone()));
                }
            }
            for (path, item) in &api.paths {
                if paths.contains_key(path) {
                    return Err(ConfigError::DuplicatePath(path.clone()));
                }
                let mut published =
                    serde_json::to_value(item).map_err(|e| ConfigError::InvalidSchema(e.to_string()))?;
                let mut methods = BTreeMap::new();
                for (method, schema) in &item.methods {
                    let method = method.to_lowercase();
                    if !HTTP_METHODS.contains(&method.as_str()) {
                        return Err(ConfigError::InvalidSchema(format!("unknown method '{}' on {}", method, path)));
                    }
                    let operation =
                        self.resolve(entity, &schema.operation_id)
                            .ok_or_else(|| ConfigError::UnknownOperation {
                                path: path.clone(),
                                method: method.clone(),
                                operation_id: schema.operation_id.clone(),
                            })?;
                    let params = merge_parameters(&item.parameters, &schema.parameters);
                    let validator = MethodValidator::build(&params, &api.definitions)?;
                    if validator.authorization.is_some() && self.authorizer.is_none() {
                        return Err(ConfigError::AuthorizerRequired {
                            path: path.clone(),
                            method,
                        });
                    }
                    methods.insert(
                        method,
                        MethodHandler::new(
                            schema.operation_id.clone(),
                            entity.id,
                            operation,
                            validator,
                            self.authorizer.clone(),
                        ),
                    );
                }

                let full = format!("{}{}", self.base_path, path.trim_end_matches('/'));
                let mut route = Route::new(full, entity.id, methods)?;
                if !route.methods.contains_key("options") {
                    let operation_id = options_operation_id(path);
                    published["options"] = json!({
                        "operationId": operation_id,
                        "responses": {
                            "204": {"description": "No Content", "headers": {"Allow": {"type": "string"}}}
                        }
                    });
                    let allow = Arc::new(AllowOperation { allow: route.allow() });
                    route.methods.insert(
                        "options".into(),
                        MethodHandler::new(
                            operation_id,
                            entity.id,
                            allow,
                            MethodValidator::default(),
                            self.authorizer.clone(),
                        ),
                    );
                }
                tracing::debug!(entity = %entity.key, path = %route.path(), "route");
                routes.push(route);
                paths.insert(path.clone(), published);
            }
        }

        doc["paths"] = Value::Object(paths);
        if !definitions.is_empty() {
            doc["definitions"] = Value::Object(definitions);
        }
        tracing::info!(routes = routes.len(), entities = self.registry.len(), "api built");
        Ok(Api {
            registry: self.registry,
            backends: self.backends,
            routes,
            doc,
            base_path: self.base_path,
            authorizer: if self.authorize_doc { self.authorizer } else { None },
        })
    }
}

/// `/cars/{id}/` -> `options_cars_id`
fn options_operation_id(path: &str) -> String {
    let norm = PATH_PARAM
        .replace_all(path.trim_matches('/'), "$1")
        .replace('/', "_");
    if norm.is_empty() {
        "options".into()
    } else {
        format!("options_{}", norm)
    }
}

/// Immutable dispatch table. Each call runs in its own session, closed before the
/// response is returned.
pub struct Api {
    registry: Arc<Registry>,
    backends: Backends,
    routes: Vec<Route>,
    doc: Value,
    base_path: String,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl Api {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn swagger_json(&self) -> &Value {
        &self.doc
    }

    pub fn doc_path(&self) -> String {
        format!("{}/doc/swagger.json", self.base_path)
    }

    pub fn session(&self) -> Session {
        Session::new(self.registry.clone(), self.backends.clone())
    }

    /// Route index and path parameters for a concrete path.
    pub fn find(&self, path: &str) -> Option<(usize, HashMap<String, String>)> {
        self.routes
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.matches(path).map(|params| (i, params)))
    }

    /// Match the path, then run the method handler.
    pub async fn dispatch(&self, mut req: ApiRequest) -> ApiResponse {
        if req.method == "get" && req.path.trim_end_matches('/') == self.doc_path() {
            return self.doc(&req).await;
        }
        let Some((idx, params)) = self.find(&req.path) else {
            return ApiResponse::empty(StatusCode::NOT_FOUND);
        };
        for (name, value) in params {
            req.path_params.entry(name).or_insert(value);
        }
        self.call(idx, req).await
    }

    /// Run route `idx` for a request whose path parameters are already extracted.
    pub async fn call(&self, idx: usize, req: ApiRequest) -> ApiResponse {
        let Some(route) = self.routes.get(idx) else {
            return ApiResponse::empty(StatusCode::NOT_FOUND);
        };
        let Some(handler) = route.handler(&req.method) else {
            return ApiResponse::empty(StatusCode::METHOD_NOT_ALLOWED).with_header("allow", &route.allow());
        };
        let mut session = self.session();
        let resp = handler.handle(&self.registry, &req, &mut session).await;
        session.close().await;
        tracing::info!(method = %req.method, path = %req.path, status = resp.status.as_u16(), "request");
        resp
    }

    /// The published document, behind the authorizer when configured.
    pub async fn doc(&self, req: &ApiRequest) -> ApiResponse {
        if let Some(authorizer) = &self.authorizer {
            let mut session = self.session();
            let denied = AssertUnwindSafe(authorizer.authorize(req, &mut session))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(AppError::Unexpected(format!(
                        "authorizer panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            session.close().await;
            match denied {
                Ok(Some(resp)) => return resp,
                Ok(None) => {}
                Err(e) => return e.to_api_response(),
            }
        }
        ApiResponse::ok(self.doc.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntityConfig;
    use crate::model::RegistryBuilder;
    use crate::store::MemoryStore;

    fn registry(api: Value) -> Arc<Registry> {
        let config: EntityConfig = serde_json::from_value(json!({
            "name": "Car",
            "columns": [{"name": "id", "type": "integer", "primary_key": true}],
            "api": api
        }))
        .unwrap();
        Arc::new(RegistryBuilder::new().register_all(vec![config]).unwrap().build().unwrap())
    }

    fn builder(api: Value) -> ApiBuilder {
        ApiBuilder::new(registry(api), Backends::new(Arc::new(MemoryStore::new()))).title("cars")
    }

    #[test]
    fn paths_match_with_trailing_slash() {
        let api = builder(json!({"paths": {"/cars/{id}": {"get": {"operationId": "swagger_get"}}}}))
            .base_path("/v1/")
            .build()
            .unwrap();
        let (idx, params) = api.find("/v1/cars/7/").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(params["id"], "7");
        assert!(api.find("/v1/cars/7/x").is_none());
        assert_eq!(api.routes()[0].path(), "/v1/cars/{id}");
        assert_eq!(api.swagger_json()["basePath"], json!("/v1"));
    }

    #[test]
    fn options_is_synthesized() {
        let api = builder(json!({"paths": {"/cars": {
            "get": {"operationId": "swagger_get_all"},
            "post": {"operationId": "swagger_insert"}
        }}}))
        .build()
        .unwrap();
        assert_eq!(api.routes()[0].methods().collect::<Vec<_>>(), vec!["get", "options", "post"]);
        assert_eq!(api.swagger_json()["paths"]["/cars"]["options"]["operationId"], json!("options_cars"));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let err = builder(json!({"paths": {"/cars": {"get": {"operationId": "fly"}}}}))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownOperation { .. }));
    }

    #[test]
    fn authorization_header_needs_an_authorizer() {
        let err = builder(json!({"paths": {"/cars": {"get": {
            "operationId": "swagger_get_all",
            "parameters": [{"name": "Authorization", "in": "header", "required": true}]
        }}}}))
        .build()
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::AuthorizerRequired { .. }));
    }

    #[test]
    fn title_or_template_is_required() {
        let api = json!({"paths": {}});
        let no_title = ApiBuilder::new(registry(api.clone()), Backends::new(Arc::new(MemoryStore::new())));
        assert!(no_title.build().is_err());
        let both = builder(api).template(json!({"swagger": "2.0", "info": {"title": "t", "version": "1"}}));
        assert!(both.build().is_err());
    }

    #[test]
    fn options_ids_drop_braces() {
        assert_eq!(options_operation_id("/cars/{id}/"), "options_cars_id");
        assert_eq!(options_operation_id("/"), "options");
    }
}
