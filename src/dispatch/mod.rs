//! Request dispatch: declared operations bound to validated, session-scoped handlers.

pub mod api;
pub mod crud;

pub use api::{Api, ApiBuilder, Route};
pub use crud::StandardOperation;

use crate::error::{AppError, ValidationError};
use crate::model::{EntityId, EntityType, Registry};
use crate::response::{ApiRequest, ApiResponse, ValidatedRequest};
use crate::session::Session;
use crate::validation::MethodValidator;
use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A callable bound to an `operationId`.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn call(
        &self,
        entity: &EntityType,
        req: ValidatedRequest,
        session: &mut Session,
    ) -> Result<ApiResponse, AppError>;
}

/// Request gate run before validation. `Ok(Some(response))` denies with that response.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, req: &ApiRequest, session: &mut Session) -> Result<Option<ApiResponse>, AppError>;
}

/// `204` with the methods declared on the path.
pub struct AllowOperation {
    pub allow: String,
}

#[async_trait]
impl Operation for AllowOperation {
    async fn call(&self, _: &EntityType, _: ValidatedRequest, _: &mut Session) -> Result<ApiResponse, AppError> {
        Ok(ApiResponse::empty(StatusCode::NO_CONTENT).with_header("allow", &self.allow))
    }
}

/// One declared method of one path.
pub struct MethodHandler {
    pub operation_id: String,
    entity: EntityId,
    operation: Arc<dyn Operation>,
    validator: MethodValidator,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl MethodHandler {
    pub fn new(
        operation_id: impl Into<String>,
        entity: EntityId,
        operation: Arc<dyn Operation>,
        validator: MethodValidator,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> Self {
        MethodHandler {
            operation_id: operation_id.into(),
            entity,
            operation,
            validator,
            authorizer,
        }
    }

    /// Authorize, validate, run. Every failure becomes a response here; a panic in the
    /// authorizer or the operation is an unexpected error.
    pub async fn handle(&self, registry: &Registry, req: &ApiRequest, session: &mut Session) -> ApiResponse {
        let result = match AssertUnwindSafe(self.run(registry, req, session)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(AppError::Unexpected(format!(
                "operation '{}' panicked: {}",
                self.operation_id,
                panic_message(panic.as_ref())
            ))),
        };
        match result {
            Ok(resp) => resp,
            Err(e) => {
                if let AppError::Validation(ValidationError { message, .. }) = &e {
                    tracing::debug!(operation = %self.operation_id, %message, "request rejected");
                }
                e.to_api_response()
            }
        }
    }

    async fn run(&self, registry: &Registry, req: &ApiRequest, session: &mut Session) -> Result<ApiResponse, AppError> {
        if let Some(authorizer) = &self.authorizer {
            if self.validator.auth_required() || req.headers.contains_key("authorization") {
                if let Some(denied) = authorizer.authorize(req, session).await? {
                    return Ok(denied);
                }
            }
        }
        let validated = self.validator.validate(req)?;
        let entity = registry.get(self.entity);
        self.operation.call(entity, validated, session).await
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
