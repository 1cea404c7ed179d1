//! Example consumer: a store catalogue served entirely from in-memory backends.
//!
//! Run from repo root: `cargo run -p example-consumer`

use async_trait::async_trait;
use schemacache::{
    app, ApiBuilder, ApiRequest, ApiResponse, AppError, AppState, Authorizer, Backends, EntityConfig,
    JobRunner, JobStatusOperation, JobSubmitOperation, JobWork, MemoryCache, MemorySearchIndex,
    MemoryStore, RegistryBuilder, Session,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts a fixed bearer token.
struct StaticToken(String);

#[async_trait]
impl Authorizer for StaticToken {
    async fn authorize(&self, req: &ApiRequest, _: &mut Session) -> Result<Option<ApiResponse>, AppError> {
        let expected = format!("Bearer {}", self.0);
        match req.headers.get("authorization") {
            Some(token) if *token == expected => Ok(None),
            _ => Ok(Some(ApiResponse::empty(axum::http::StatusCode::UNAUTHORIZED))),
        }
    }
}

fn entities() -> Result<Vec<EntityConfig>, serde_json::Error> {
    serde_json::from_value(json!([
        {
            "name": "StoreModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                {"name": "name", "type": "string", "nullable": false}
            ],
            "relationships": [
                {"name": "items", "target": "item", "cardinality": "many", "local_column": "id", "remote_column": "store_id"}
            ],
            "api": {
                "paths": {
                    "/stores": {
                        "post": {"operationId": "swagger_insert", "parameters": [{"name": "body", "in": "body", "required": true, "schema": {"type": "array"}}]},
                        "get": {"operationId": "swagger_get_all", "parameters": [
                            {"name": "limit", "in": "query", "type": "integer"},
                            {"name": "offset", "in": "query", "type": "integer"}
                        ]}
                    },
                    "/stores/{id}": {
                        "parameters": [{"name": "id", "in": "path", "required": true, "type": "integer"}],
                        "get": {"operationId": "swagger_get"},
                        "delete": {"operationId": "swagger_delete", "parameters": [{"name": "Authorization", "in": "header", "required": true}]}
                    },
                    "/stores/reindex": {
                        "post": {"operationId": "reindex"},
                        "get": {"operationId": "reindex_status", "parameters": [{"name": "job_hash", "in": "query"}]}
                    }
                }
            }
        },
        {
            "name": "ItemModel",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "auto_increment": true},
                {"name": "store_id", "type": "integer"},
                {"name": "name", "type": "string"}
            ]
        }
    ]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("schemacache=debug,example_consumer=info")),
        )
        .init();

    let registry = Arc::new(RegistryBuilder::new().register_all(entities()?)?.build()?);
    let cache = Arc::new(MemoryCache::new());
    let backends = Backends::new(Arc::new(MemoryStore::new()))
        .with_cache(cache.clone())
        .with_search(Arc::new(MemorySearchIndex::new()));
    let jobs = JobRunner::new(cache);

    let reindex = JobSubmitOperation::new(jobs.clone(), |entity, _req| {
        let key = entity.key.clone();
        Ok(JobWork::suspendable(move |session| {
            Box::pin(async move {
                let registry = session.registry().clone();
                let Some(store) = registry.by_key(&key) else {
                    return Err(AppError::Unexpected(format!("unknown entity {}", key)));
                };
                let stores = schemacache::model::get(session, store, Default::default()).await?;
                Ok(json!({ "reindexed": stores.len() }))
            })
        }))
    });

    let api = ApiBuilder::new(registry, backends)
        .title("Store catalogue")
        .authorizer(Arc::new(StaticToken("secret".into())))
        .authorize_doc(false)
        .operation("store", "reindex", Arc::new(reindex))
        .operation("store", "reindex_status", Arc::new(JobStatusOperation::new(jobs)))
        .build()?;

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!("Example consumer listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app(AppState::new(api), 2 * 1024 * 1024)).await?;
    Ok(())
}
