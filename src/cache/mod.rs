//! Cache store collaborator: hash buckets, membership sets, plain keys with expiry.

pub mod memory;

use crate::error::CacheError;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryCache;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Values of `fields` in hash `key`, positionally; missing fields are None.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), CacheError>;

    /// Remove `fields` from hash `key`; returns how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, CacheError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CacheError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, CacheError>;

    /// Add `member` to set `key`; true when it was not present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Remaining time to live; None when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Set expiry on an existing key; false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut values = self.hmget(key, &[field.to_string()]).await?;
        Ok(values.pop().flatten())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        self.hmset(key, &[(field.to_string(), value.to_string())]).await
    }
}
