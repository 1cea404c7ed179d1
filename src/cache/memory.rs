//! In-process cache with Redis-like hash/set/string semantics and lazy expiry.

use super::CacheStore;
use crate::error::CacheError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
enum Data {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    Str(String),
}

#[derive(Clone, Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Backend(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, CacheError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| CacheError::Backend("memory cache lock poisoned".into()))?;
        let now = Instant::now();
        guard.retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        Ok(guard)
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().map(|g| g.keys().cloned().collect()).unwrap_or_default();
        keys.sort();
        keys
    }
}

fn hash_of<'a>(map: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a BTreeMap<String, String>>, CacheError> {
    match map.get(key).map(|e| &e.data) {
        None => Ok(None),
        Some(Data::Hash(h)) => Ok(Some(h)),
        Some(_) => Err(wrong_type(key)),
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let map = self.lock()?;
        let hash = hash_of(&map, key)?;
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut map = self.lock()?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            data: Data::Hash(BTreeMap::new()),
            expires_at: None,
        });
        let Data::Hash(hash) = &mut entry.data else {
            return Err(wrong_type(key));
        };
        for (f, v) in entries {
            hash.insert(f.clone(), v.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, CacheError> {
        let mut map = self.lock()?;
        let Some(entry) = map.get_mut(key) else {
            return Ok(0);
        };
        let Data::Hash(hash) = &mut entry.data else {
            return Err(wrong_type(key));
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count() as u64;
        if hash.is_empty() {
            map.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, CacheError> {
        let map = self.lock()?;
        Ok(hash_of(&map, key)?
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let map = self.lock()?;
        Ok(hash_of(&map, key)?
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            data: Data::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.data {
            Data::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let map = self.lock()?;
        match map.get(key).map(|e| &e.data) {
            None => Ok(Vec::new()),
            Some(Data::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let map = self.lock()?;
        match map.get(key).map(|e| &e.data) {
            None => Ok(None),
            Some(Data::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut map = self.lock()?;
        map.insert(
            key.to_string(),
            Entry {
                data: Data::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let map = self.lock()?;
        let now = Instant::now();
        Ok(map
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut map = self.lock()?;
        match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
