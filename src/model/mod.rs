//! Entity model layer: registry, identity, and the per-kind operations.

pub mod cached;
pub mod identity;
pub mod registry;
pub mod relational;

pub use identity::{key_part, EntityRef};
pub use registry::{
    BackRef, EntityId, EntityType, ForeignKeySide, JoinTable, Registry, RegistryBuilder, Relationship,
};
pub use relational::GetQuery;

use crate::config::EntityKind;
use crate::error::{AppError, ModelError};
use crate::session::Session;
use crate::store::Row;
use serde_json::Value;

pub async fn insert(session: &mut Session, entity: &EntityType, objs: &Value) -> Result<Vec<Value>, AppError> {
    match entity.kind {
        EntityKind::Relational => relational::insert(session, entity, objs).await,
        EntityKind::Cache => cached::insert(session, entity, objs).await,
    }
}

pub async fn update(
    session: &mut Session,
    entity: &EntityType,
    objs: &Value,
    ids: Option<Vec<Row>>,
) -> Result<Vec<Value>, AppError> {
    match entity.kind {
        EntityKind::Relational => relational::update(session, entity, objs, ids).await,
        EntityKind::Cache => {
            let objs = match ids {
                Some(ids) => {
                    let mut merged = Vec::new();
                    for (mut obj, id) in relational::as_objects(objs)?.into_iter().zip(ids) {
                        obj.extend(id);
                        merged.push(Value::Object(obj));
                    }
                    Value::Array(merged)
                }
                None => objs.clone(),
            };
            cached::update(session, entity, &objs).await
        }
    }
}

pub async fn delete(session: &mut Session, entity: &EntityType, ids: &[Row]) -> Result<(), AppError> {
    match entity.kind {
        EntityKind::Relational => relational::delete(session, entity, ids).await,
        EntityKind::Cache => cached::delete(session, entity, ids).await,
    }
}

pub async fn get(session: &mut Session, entity: &EntityType, query: GetQuery) -> Result<Vec<Value>, AppError> {
    match entity.kind {
        EntityKind::Relational => relational::get(session, entity, query).await,
        EntityKind::Cache => {
            if let Some(name) = query.filters.keys().next() {
                return Err(ModelError::new(format!(
                    "{} is an invalid keyword argument for {}",
                    name, entity.name
                ))
                .with_instance(Value::Object(query.filters.clone()))
                .into());
            }
            cached::get(session, entity, query.ids, query.limit, query.offset).await
        }
    }
}

/// Pattern search through the search index; empty when the entity or process has none.
pub async fn search(
    session: &mut Session,
    entity: &EntityType,
    pattern: &str,
    page: u64,
    size: u64,
) -> Result<Vec<Value>, AppError> {
    match (entity.use_search, session.search()) {
        (true, Some(index)) => Ok(index.search(&entity.key, pattern, page, size).await?),
        _ => Ok(Vec::new()),
    }
}
