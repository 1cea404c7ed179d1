//! Transport-neutral request/response envelope used by the dispatcher.

use axum::{
    body::Body,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Request after transport decoding. Header names are lowercase; repeated query keys
/// are already joined with commas.
#[derive(Clone, Debug, Default)]
pub struct ApiRequest {
    pub path: String,
    pub method: String,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str) -> Self {
        ApiRequest {
            path: path.to_string(),
            method: method.to_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    /// Attach a JSON body and the matching content-type.
    pub fn with_json(mut self, body: &Value) -> Self {
        self.headers
            .insert("content-type".into(), "application/json".into());
        self.body = Some(body.to_string().into_bytes());
        self
    }
}

/// Request after validation: every parameter is typed per the declared schema.
#[derive(Clone, Debug, Default)]
pub struct ValidatedRequest {
    pub path: String,
    pub method: String,
    pub path_params: Map<String, Value>,
    pub query: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
    pub body_schema: Option<Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiResponse {
    pub fn json(status: StatusCode, body: Value) -> Self {
        ApiResponse {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(body),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        ApiResponse {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_lowercase(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn created(body: Value) -> Self {
        Self::json(StatusCode::CREATED, body)
    }

    pub fn ok(body: Value) -> Self {
        Self::json(StatusCode::OK, body)
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let body = match &self.body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        let mut resp = Response::new(body);
        *resp.status_mut() = self.status;
        let headers = resp.headers_mut();
        for (k, v) in &self.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) else {
                tracing::warn!(header = %k, "dropping invalid response header");
                continue;
            };
            headers.insert(name, value);
        }
        if self.body.is_some() && !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        resp
    }
}
