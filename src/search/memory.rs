//! In-process search index: case-insensitive substring match over the serialized document.

use super::SearchIndex;
use crate::error::SearchError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

type Documents = HashMap<String, BTreeMap<String, Value>>;

#[derive(Clone, Default)]
pub struct MemorySearchIndex {
    inner: Arc<Mutex<Documents>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Documents>, SearchError> {
        self.inner
            .lock()
            .map_err(|_| SearchError::Backend("memory search lock poisoned".into()))
    }

    fn put(&self, doc_type: &str, docs: &[(String, Value)]) -> Result<(), SearchError> {
        let mut index = self.lock()?;
        let by_id = index.entry(doc_type.to_string()).or_default();
        for (id, doc) in docs {
            by_id.insert(id.clone(), doc.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn bulk_create(&self, doc_type: &str, docs: &[(String, Value)]) -> Result<(), SearchError> {
        self.put(doc_type, docs)
    }

    async fn bulk_update(&self, doc_type: &str, docs: &[(String, Value)]) -> Result<(), SearchError> {
        self.put(doc_type, docs)
    }

    async fn bulk_delete(&self, doc_type: &str, ids: &[String]) -> Result<(), SearchError> {
        let mut index = self.lock()?;
        if let Some(by_id) = index.get_mut(doc_type) {
            for id in ids {
                by_id.remove(id);
            }
        }
        Ok(())
    }

    async fn search(&self, doc_type: &str, pattern: &str, page: u64, size: u64) -> Result<Vec<Value>, SearchError> {
        let index = self.lock()?;
        let needle = pattern.to_lowercase();
        let Some(by_id) = index.get(doc_type) else {
            return Ok(Vec::new());
        };
        Ok(by_id
            .values()
            .filter(|doc| doc.to_string().to_lowercase().contains(&needle))
            .skip((page * size) as usize)
            .take(size as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn update_replaces_instead_of_duplicating() {
        let index = MemorySearchIndex::new();
        index
            .bulk_create("car", &[("1".into(), json!({"id": 1, "model": "Beetle"}))])
            .await
            .unwrap();
        index
            .bulk_update("car", &[("1".into(), json!({"id": 1, "model": "Beetle GT"}))])
            .await
            .unwrap();
        let hits = index.search("car", "beetle", 0, 10).await.unwrap();
        assert_eq!(hits, vec![json!({"id": 1, "model": "Beetle GT"})]);
        index.bulk_delete("car", &["1".into()]).await.unwrap();
        assert!(index.search("car", "beetle", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pages_are_ordered_by_id() {
        let index = MemorySearchIndex::new();
        let docs: Vec<(String, Value)> = (1..=5).map(|i| (format!("{i}"), json!({"id": i, "tag": "x"}))).collect();
        index.bulk_create("t", &docs).await.unwrap();
        let second = index.search("t", "X", 1, 2).await.unwrap();
        assert_eq!(second, vec![json!({"id": 3, "tag": "x"}), json!({"id": 4, "tag": "x"})]);
    }
}
