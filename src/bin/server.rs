//! schemacache server: loads entity declarations, ensures tables, serves the declared API.

use schemacache::{
    app, ensure_tables, load_entities_from_dir, ApiBuilder, AppState, Backends, MemoryCache, PgStore,
    RegistryBuilder, Settings,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("schemacache=info")),
        )
        .init();

    let settings = Settings::from_env()?;
    let database_url = settings
        .database_url
        .clone()
        .unwrap_or_else(|| "postgres://localhost/schemacache".into());

    let entities = load_entities_from_dir(&settings.models_path).await?;
    let registry = Arc::new(
        RegistryBuilder::new()
            .key_separator(settings.key_separator.clone())
            .register_all(entities)?
            .build()?,
    );
    tracing::info!(entities = registry.len(), path = %settings.models_path, "entities loaded");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    ensure_tables(&pool, &registry).await?;

    let backends = Backends::new(Arc::new(PgStore::new(pool))).with_cache(Arc::new(MemoryCache::new()));
    let api = ApiBuilder::new(registry, backends)
        .title(settings.api_title.clone().unwrap_or_else(|| env!("CARGO_PKG_NAME").into()))
        .version(settings.api_version.clone())
        .base_path(settings.api_base_path.clone())
        .build()?;

    let router = app(AppState::new(api), settings.max_body_bytes);
    let listener = TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}
