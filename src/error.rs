//! Typed errors and HTTP mapping.

use crate::response::ApiResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Body message for every 500; details only go to the log.
pub const UNEXPECTED_MESSAGE: &str = "Something unexpected happened";

/// Malformed or non-conforming request input. Always a 400 with a structured body.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub schema: Option<Value>,
    pub instance: Option<Value>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
            schema: None,
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: Value) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".into(), Value::String(self.message.clone()));
        if let Some(Value::Object(schema)) = &self.schema {
            if !schema.is_empty() {
                body.insert("schema".into(), Value::Object(schema.clone()));
            }
        }
        if let Some(instance) = self.instance.as_ref().filter(|v| is_truthy(v)) {
            body.insert("instance".into(), instance.clone());
        }
        Value::Object(body)
    }
}

/// Domain-rule violation raised by the entity layer (bad nested operation, unknown attribute).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ModelError {
    pub message: String,
    pub instance: Option<Value>,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        ModelError {
            message: message.into(),
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: Value) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("message".into(), Value::String(self.message.clone()));
        if let Some(instance) = &self.instance {
            body.insert("instance".into(), instance.clone());
        }
        Value::Object(body)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    /// Constraint violation reported by the relational engine.
    #[error("integrity ({code}): {message}")]
    Integrity {
        code: String,
        message: String,
        params: Value,
        details: Option<String>,
    },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("transaction already finished")]
    TransactionClosed,
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("store: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache: {0}")]
    Backend(String),
    #[error("cache value for {key}/{field} is not valid json: {source}")]
    Decode {
        key: String,
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("search: {0}")]
    Backend(String),
}

/// Build-time failures: entity registration, relationship resolution, API assembly.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("entity '{0}' was already registered")]
    DuplicateEntity(String),
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("entity '{0}' must declare at least one primary key column")]
    NoPrimaryKey(String),
    #[error("invalid entity {entity}: {reason}")]
    InvalidEntity { entity: String, reason: String },
    #[error("invalid relationship {entity}.{name}: {reason}")]
    InvalidRelationship {
        entity: String,
        name: String,
        reason: String,
    },
    #[error("operationId '{operation_id}' was not found ({method} {path})")]
    UnknownOperation {
        path: String,
        method: String,
        operation_id: String,
    },
    #[error("duplicate path: {0}")]
    DuplicatePath(String),
    #[error("duplicate definition: {0}")]
    DuplicateDefinition(String),
    #[error("'authorizer' is required when the 'Authorization' header is declared ({method} {path})")]
    AuthorizerRequired { path: String, method: String },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("config load: {0}")]
    Load(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Unexpected(String),
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Store(StoreError::Db(e))
    }
}

impl AppError {
    /// Stable class name, recorded in job error results.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "ConfigError",
            AppError::Validation(_) => "ValidationError",
            AppError::Model(_) => "ModelError",
            AppError::Store(StoreError::Integrity { .. }) => "IntegrityError",
            AppError::Store(_) => "StoreError",
            AppError::Cache(_) => "CacheError",
            AppError::Search(_) => "SearchError",
            AppError::Json(_) => "JsonError",
            AppError::Unexpected(_) => "Unexpected",
        }
    }

    pub fn to_api_response(&self) -> ApiResponse {
        match self {
            AppError::Validation(e) => ApiResponse::json(StatusCode::BAD_REQUEST, e.to_body()),
            AppError::Model(e) => ApiResponse::json(StatusCode::BAD_REQUEST, e.to_body()),
            AppError::Store(StoreError::Integrity {
                code,
                message,
                params,
                details,
            }) => {
                let mut body = json!({
                    "params": params,
                    "database message": {
                        "code": code,
                        "message": message,
                    }
                });
                if let Some(details) = details.as_ref().filter(|d| !d.is_empty()) {
                    body["details"] = Value::String(details.clone());
                }
                ApiResponse::json(StatusCode::BAD_REQUEST, body)
            }
            other => {
                tracing::error!(error = %other, kind = other.kind(), "unexpected error");
                unexpected_response()
            }
        }
    }
}

pub fn unexpected_response() -> ApiResponse {
    ApiResponse::json(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "message": UNEXPECTED_MESSAGE }),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.to_api_response().into_response()
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_body_omits_empty_schema_and_falsy_instance() {
        let e = ValidationError::new("bad")
            .with_schema(json!({}))
            .with_instance(json!(""));
        assert_eq!(e.to_body(), json!({ "message": "bad" }));

        let e = ValidationError::new("bad")
            .with_schema(json!({ "type": "array" }))
            .with_instance(json!("test"));
        assert_eq!(
            e.to_body(),
            json!({ "message": "bad", "schema": { "type": "array" }, "instance": "test" })
        );
    }

    #[test]
    fn integrity_maps_to_400_with_database_message() {
        let e = AppError::Store(StoreError::Integrity {
            code: "23505".into(),
            message: "duplicate key".into(),
            params: json!({ "id": 1 }),
            details: None,
        });
        let resp = e.to_api_response();
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.body,
            Some(json!({
                "params": { "id": 1 },
                "database message": { "code": "23505", "message": "duplicate key" }
            }))
        );
    }

    #[test]
    fn unexpected_errors_hide_detail() {
        let resp = AppError::Unexpected("secret".into()).to_api_response();
        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.body, Some(json!({ "message": UNEXPECTED_MESSAGE })));
    }
}
