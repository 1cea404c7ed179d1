//! Search index collaborator: documents addressed by type and id, pattern queries.

pub mod memory;

use crate::error::SearchError;
use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemorySearchIndex;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn bulk_create(&self, doc_type: &str, docs: &[(String, Value)]) -> Result<(), SearchError>;

    async fn bulk_update(&self, doc_type: &str, docs: &[(String, Value)]) -> Result<(), SearchError>;

    async fn bulk_delete(&self, doc_type: &str, ids: &[String]) -> Result<(), SearchError>;

    /// Documents matching `pattern`, page `page` (zero based) of `size` hits.
    async fn search(&self, doc_type: &str, pattern: &str, page: u64, size: u64) -> Result<Vec<Value>, SearchError>;
}
