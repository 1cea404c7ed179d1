//! Consistency session: one relational transaction plus the cache bookkeeping that
//! follows it. Writes made through the entity layer mark instances dirty or deleted;
//! `commit` publishes the relational change and then mirrors it into every cache bucket
//! of the affected types, including instances whose cached form embeds a changed one.

use crate::cache::CacheStore;
use crate::config::EntityKind;
use crate::error::{AppError, ModelError, StoreError};
use crate::model::{relational, EntityId, EntityRef, EntityType, Registry};
use crate::search::SearchIndex;
use crate::store::{RelationalStore, RelationalTx, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Storage collaborators shared by every session.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn RelationalStore>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub search: Option<Arc<dyn SearchIndex>>,
}

impl Backends {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Backends {
            store,
            cache: None,
            search: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }
}

#[derive(Default)]
struct CachePlan {
    deletes: BTreeMap<EntityId, Vec<String>>,
    stale: BTreeMap<EntityId, Vec<String>>,
    sets: BTreeMap<EntityId, Vec<(String, String)>>,
}

pub struct Session {
    registry: Arc<Registry>,
    backends: Backends,
    tx: Option<Box<dyn RelationalTx>>,
    to_set: HashMap<EntityRef, Row>,
    to_delete: HashMap<EntityRef, Row>,
    /// Current identity -> identity last written to the cache.
    renamed: HashMap<EntityRef, String>,
}

impl Session {
    pub fn new(registry: Arc<Registry>, backends: Backends) -> Self {
        Session {
            registry,
            backends,
            tx: None,
            to_set: HashMap::new(),
            to_delete: HashMap::new(),
            renamed: HashMap::new(),
        }
    }

    /// A fresh session over the same stores, with no transaction or tracked state.
    pub fn fork(&self) -> Session {
        Session::new(self.registry.clone(), self.backends.clone())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.backends.cache.as_ref()
    }

    pub fn search(&self) -> Option<&Arc<dyn SearchIndex>> {
        self.backends.search.as_ref()
    }

    /// The open transaction, begun on first use.
    pub async fn tx(&mut self) -> Result<&mut (dyn RelationalTx + 'static), StoreError> {
        if self.tx.is_none() {
            self.tx = Some(self.backends.store.begin().await?);
        }
        self.tx.as_deref_mut().ok_or(StoreError::TransactionClosed)
    }

    fn tracks(&self, entity: &EntityType) -> bool {
        self.backends.cache.is_some() && entity.use_cache && entity.kind == EntityKind::Relational
    }

    pub(crate) fn mark_persisted(&mut self, entity: &EntityType, row: &Row) -> Result<(), ModelError> {
        if !self.tracks(entity) {
            return Ok(());
        }
        let r = entity.entity_ref(row)?;
        self.to_delete.remove(&r);
        self.to_set.insert(r, entity.ids_of(row));
        Ok(())
    }

    pub(crate) fn mark_renamed(&mut self, entity: &EntityType, old_key: String, row: &Row) -> Result<(), ModelError> {
        if !self.tracks(entity) {
            return Ok(());
        }
        let r = entity.entity_ref(row)?;
        let first = self.renamed.remove(&EntityRef { entity: entity.id, key: old_key.clone() });
        self.renamed.insert(r, first.unwrap_or(old_key));
        Ok(())
    }

    /// Seed instances whose cached form must be rebuilt even if nothing else reaches them.
    pub(crate) fn mark_related(&mut self, related: Vec<(EntityRef, Row)>) {
        let registry = self.registry.clone();
        for (r, ids) in related {
            if self.tracks(registry.get(r.entity)) && !self.to_delete.contains_key(&r) {
                self.to_set.insert(r, ids);
            }
        }
    }

    pub(crate) fn mark_deleted(
        &mut self,
        entity: &EntityType,
        row: &Row,
        related: Vec<(EntityRef, Row)>,
    ) -> Result<(), ModelError> {
        if !self.tracks(entity) {
            self.mark_related(related);
            return Ok(());
        }
        let r = entity.entity_ref(row)?;
        self.to_set.remove(&r);
        if let Some(old) = self.renamed.remove(&r) {
            self.to_delete.insert(EntityRef { entity: entity.id, key: old }, Row::new());
        }
        self.to_delete.insert(r, entity.ids_of(row));
        self.mark_related(related);
        Ok(())
    }

    fn clear(&mut self) {
        self.to_set.clear();
        self.to_delete.clear();
        self.renamed.clear();
    }

    /// Commit the relational transaction, then propagate to the cache. Tracked state is
    /// cleared whatever the outcome, so the session can keep working and commit again.
    pub async fn commit(&mut self) -> Result<(), AppError> {
        let result = self.commit_inner().await;
        self.clear();
        result
    }

    async fn commit_inner(&mut self) -> Result<(), AppError> {
        let has_work = self.backends.cache.is_some() && (!self.to_set.is_empty() || !self.to_delete.is_empty());
        let plan = if has_work { Some(self.plan().await?) } else { None };
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        let (Some(plan), Some(cache)) = (plan, self.backends.cache.clone()) else {
            return Ok(());
        };
        if let Err(e) = self.propagate(cache.as_ref(), plan).await {
            tracing::warn!(error = %e, "cache propagation failed after relational commit");
            return Err(e);
        }
        Ok(())
    }

    /// Serialize the refresh closure while the transaction still sees its own writes.
    async fn plan(&mut self) -> Result<CachePlan, AppError> {
        let registry = self.registry.clone();
        let mut closure: HashMap<EntityRef, Row> = self.to_set.clone();
        let mut frontier: Vec<(EntityRef, Row)> = closure.iter().map(|(r, ids)| (r.clone(), ids.clone())).collect();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (r, ids) in frontier {
                let entity = registry.get(r.entity);
                for (rel_ref, rel_ids) in relational::related(self, entity, &ids).await? {
                    if !closure.contains_key(&rel_ref) {
                        closure.insert(rel_ref.clone(), rel_ids.clone());
                        next.push((rel_ref, rel_ids));
                    }
                }
            }
            frontier = next;
        }
        for r in self.to_delete.keys() {
            closure.remove(r);
        }

        let mut plan = CachePlan::default();
        let ordered: BTreeMap<EntityRef, Row> = closure.into_iter().collect();
        for (r, ids) in ordered {
            let entity = registry.get(r.entity);
            if !self.tracks(entity) {
                continue;
            }
            let Some(row) = relational::load_row(self, entity, &ids).await? else {
                continue;
            };
            let body = relational::todict(self, entity, &row).await?;
            if let Some(old) = self.renamed.get(&r).filter(|old| **old != r.key) {
                plan.stale.entry(r.entity).or_default().push(old.clone());
            }
            plan.sets.entry(r.entity).or_default().push((r.key, body.to_string()));
        }
        for r in self.to_delete.keys() {
            plan.deletes.entry(r.entity).or_default().push(r.key.clone());
        }
        Ok(plan)
    }

    async fn propagate(&self, cache: &dyn CacheStore, plan: CachePlan) -> Result<(), AppError> {
        for (id, keys) in &plan.deletes {
            let entity = self.registry.get(*id);
            for bucket in buckets(cache, entity).await? {
                let removed = cache.hdel(&bucket, keys).await?;
                tracing::debug!(entity = %entity.key, bucket = %bucket, removed, "cache delete");
            }
        }
        for (id, entries) in &plan.sets {
            let entity = self.registry.get(*id);
            let stale = plan.stale.get(id);
            for bucket in buckets(cache, entity).await? {
                if let Some(stale) = stale {
                    cache.hdel(&bucket, stale).await?;
                }
                cache.hmset(&bucket, entries).await?;
                tracing::debug!(entity = %entity.key, bucket = %bucket, count = entries.len(), "cache set");
            }
        }
        Ok(())
    }

    pub async fn rollback(&mut self) -> Result<(), AppError> {
        self.clear();
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    /// End the session. An uncommitted transaction is rolled back.
    pub async fn close(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                tracing::warn!(error = %e, "rollback on session close failed");
            }
        }
    }
}

/// Base bucket plus every filtered bucket recorded for `entity`.
pub(crate) async fn buckets(cache: &dyn CacheStore, entity: &EntityType) -> Result<Vec<String>, AppError> {
    let mut names: BTreeSet<String> = cache
        .smembers(&entity.filters_names_key())
        .await?
        .into_iter()
        .collect();
    names.insert(entity.key.clone());
    Ok(names.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::RegistryBuilder;
    use crate::store::MemoryStore;

    fn assert_send_sync<T: Send + Sync>() {}

    #[tokio::test]
    async fn sessions_move_into_spawned_tasks() {
        assert_send_sync::<Session>();
        let registry = Arc::new(RegistryBuilder::new().build().unwrap());
        let backends = Backends::new(Arc::new(MemoryStore::new())).with_cache(Arc::new(MemoryCache::new()));
        let mut session = Session::new(registry, backends);
        let handle = tokio::spawn(async move {
            session.tx().await?;
            session.commit().await?;
            Ok::<_, AppError>(session)
        });
        handle.await.unwrap().unwrap().close().await;
    }
}
