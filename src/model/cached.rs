//! Cache-only entities: objects stored as JSON in the entity's hash bucket, optionally
//! mirrored into the search index.

use super::registry::EntityType;
use super::relational::{as_objects, OPERATION_KEY};
use crate::cache::CacheStore;
use crate::error::{AppError, CacheError};
use crate::session::Session;
use crate::store::Row;
use serde_json::Value;
use std::sync::Arc;

const CHUNK_SIZE: usize = 100;

fn cache_of(session: &Session) -> Result<Arc<dyn CacheStore>, AppError> {
    session
        .cache()
        .cloned()
        .ok_or_else(|| AppError::Unexpected("cache store is not configured".into()))
}

fn decode(bucket: &str, field: &str, text: &str) -> Result<Value, CacheError> {
    serde_json::from_str(text).map_err(|source| CacheError::Decode {
        key: bucket.to_string(),
        field: field.to_string(),
        source,
    })
}

fn keyed(entity: &EntityType, objects: &[Row]) -> Result<Vec<(String, Value)>, AppError> {
    objects
        .iter()
        .map(|o| Ok((entity.identity(o)?, Value::Object(o.clone()))))
        .collect()
}

fn encoded(docs: &[(String, Value)]) -> Vec<(String, String)> {
    docs.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
}

pub async fn insert(session: &mut Session, entity: &EntityType, objs: &Value) -> Result<Vec<Value>, AppError> {
    let cache = cache_of(session)?;
    let objects = as_objects(objs)?;
    let docs = keyed(entity, &objects)?;
    for chunk in docs.chunks(CHUNK_SIZE) {
        cache.hmset(&entity.key, &encoded(chunk)).await?;
        if let (true, Some(search)) = (entity.use_search, session.search()) {
            search.bulk_create(&entity.key, chunk).await?;
        }
    }
    tracing::debug!(entity = %entity.key, count = docs.len(), "cache-only insert");
    Ok(docs.into_iter().map(|(_, v)| v).collect())
}

/// Write objects whose key already exists; objects flagged `"_operation": "delete"` are
/// removed instead. Returns the written objects, or the deleted ones when nothing was written.
pub async fn update(session: &mut Session, entity: &EntityType, objs: &Value) -> Result<Vec<Value>, AppError> {
    let cache = cache_of(session)?;
    let mut to_set = Vec::new();
    let mut to_delete = Vec::new();
    for mut obj in as_objects(objs)? {
        let op = obj.remove(OPERATION_KEY);
        let key = entity.identity(&obj)?;
        if op.as_ref().and_then(Value::as_str) == Some("delete") {
            to_delete.push((key, Value::Object(obj)));
        } else {
            to_set.push((key, Value::Object(obj)));
        }
    }

    let keys: Vec<String> = to_set.iter().map(|(k, _)| k.clone()).collect();
    let present = cache.hmget(&entity.key, &keys).await?;
    let to_set: Vec<(String, Value)> = to_set
        .into_iter()
        .zip(present)
        .filter_map(|(doc, hit)| hit.map(|_| doc))
        .collect();

    if !to_set.is_empty() {
        cache.hmset(&entity.key, &encoded(&to_set)).await?;
        if let (true, Some(search)) = (entity.use_search, session.search()) {
            search.bulk_update(&entity.key, &to_set).await?;
        }
    }
    if !to_delete.is_empty() {
        let keys: Vec<String> = to_delete.iter().map(|(k, _)| k.clone()).collect();
        cache.hdel(&entity.key, &keys).await?;
        if let (true, Some(search)) = (entity.use_search, session.search()) {
            search.bulk_delete(&entity.key, &keys).await?;
        }
    }

    let written = if to_set.is_empty() { to_delete } else { to_set };
    Ok(written.into_iter().map(|(_, v)| v).collect())
}

pub async fn delete(session: &mut Session, entity: &EntityType, ids: &[Row]) -> Result<(), AppError> {
    let cache = cache_of(session)?;
    let keys: Vec<String> = ids
        .iter()
        .map(|i| entity.identity(&entity.cast_row(i)?).map_err(AppError::from))
        .collect::<Result<_, _>>()?;
    if keys.is_empty() {
        return Ok(());
    }
    cache.hdel(&entity.key, &keys).await?;
    if let (true, Some(search)) = (entity.use_search, session.search()) {
        search.bulk_delete(&entity.key, &keys).await?;
    }
    Ok(())
}

/// Every object, a page of keys (by key order), or specific ids.
pub async fn get(
    session: &mut Session,
    entity: &EntityType,
    ids: Option<Vec<Row>>,
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<Vec<Value>, AppError> {
    let cache = cache_of(session)?;
    let bucket = &entity.key;
    let keys: Vec<String> = match ids {
        Some(ids) => ids
            .iter()
            .map(|i| entity.identity(&entity.cast_row(i)?).map_err(AppError::from))
            .collect::<Result<_, _>>()?,
        None if limit.is_none() && offset.is_none() => {
            return cache
                .hgetall(bucket)
                .await?
                .iter()
                .map(|(k, v)| decode(bucket, k, v).map_err(AppError::from))
                .collect();
        }
        None => {
            let mut all = cache.hkeys(bucket).await?;
            all.sort();
            let start = offset.unwrap_or(0) as usize;
            let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
            all.into_iter().skip(start).take(take).collect()
        }
    };
    let values = cache.hmget(bucket, &keys).await?;
    let mut out = Vec::with_capacity(keys.len());
    for (key, hit) in keys.iter().zip(values) {
        if let Some(text) = hit {
            out.push(decode(bucket, key, &text)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::EntityConfig;
    use crate::model::RegistryBuilder;
    use crate::search::{MemorySearchIndex, SearchIndex};
    use crate::session::Backends;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn session(search: Arc<MemorySearchIndex>) -> Session {
        let config: EntityConfig = serde_json::from_value(json!({
            "name": "CarModel",
            "kind": "cache",
            "id_names": ["id"],
            "use_search": true
        }))
        .unwrap();
        let registry = RegistryBuilder::new().register_all(vec![config]).unwrap().build().unwrap();
        let backends = Backends::new(Arc::new(MemoryStore::new()))
            .with_cache(Arc::new(MemoryCache::new()))
            .with_search(search);
        Session::new(Arc::new(registry), backends)
    }

    #[tokio::test]
    async fn insert_update_delete_roundtrip() {
        let search = Arc::new(MemorySearchIndex::new());
        let mut s = session(search.clone());
        let registry = s.registry().clone();
        let car = registry.by_key("car").unwrap();

        let objs = json!([{"id": 1, "model": "beetle"}, {"id": 2, "model": "kombi"}]);
        insert(&mut s, car, &objs).await.unwrap();
        assert_eq!(get(&mut s, car, None, None, None).await.unwrap().len(), 2);

        let written = update(&mut s, car, &json!([{"id": 1, "model": "fusca"}, {"id": 9, "model": "ghost"}]))
            .await
            .unwrap();
        assert_eq!(written, vec![json!({"id": 1, "model": "fusca"})]);
        assert_eq!(search.search("car", "fusca", 0, 10).await.unwrap().len(), 1);

        let deleted = update(&mut s, car, &json!({"id": 2, "_operation": "delete"})).await.unwrap();
        assert_eq!(deleted, vec![json!({"id": 2})]);
        let ids = vec![json!({"id": 1}).as_object().cloned().unwrap(), json!({"id": 2}).as_object().cloned().unwrap()];
        assert_eq!(get(&mut s, car, Some(ids), None, None).await.unwrap().len(), 1);

        delete(&mut s, car, &[json!({"id": 1}).as_object().cloned().unwrap()]).await.unwrap();
        assert!(get(&mut s, car, None, Some(10), Some(0)).await.unwrap().is_empty());
        assert!(search.search("car", "", 0, 10).await.unwrap().is_empty());
    }
}
