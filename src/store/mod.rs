//! Shared key/value cache store.
//!
//! The client never owns throttle, credential or response state itself; it
//! reads and writes them through a [`CacheStore`]. Any backend with TTL
//! semantics works (Redis, memcached). [`InMemoryCacheStore`] covers a single
//! process and tests.

use crate::errors::EsiResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Longest lifetime an in-memory entry can have; larger TTLs are capped to it.
const MAX_ENTRY_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Cache store interface.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Gets a live value.
    async fn get(&self, key: &str) -> EsiResult<Option<Value>>;

    /// Stores a value that expires after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> EsiResult<()>;

    /// Deletes several keys.
    async fn delete_many(&self, keys: &[String]) -> EsiResult<()>;

    /// Gets several live values; missing keys are absent from the map.
    async fn get_many(&self, keys: &[String]) -> EsiResult<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    /// Stores several values with a shared TTL.
    async fn set_many(&self, values: HashMap<String, Value>, ttl: Duration) -> EsiResult<()> {
        for (key, value) in values {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> EsiResult<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> EsiResult<()> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl.min(MAX_ENTRY_TTL))
            .unwrap_or(now);
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> EsiResult<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let store = InMemoryCacheStore::new();
        store
            .set("key", json!("value"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some(json!("value")));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
        assert_eq!(store.purge_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_is_capped() {
        let store = InMemoryCacheStore::new();
        store.set("key", json!("value"), Duration::MAX).await.unwrap();

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert_eq!(store.get("key").await.unwrap(), Some(json!("value")));
    }

    #[tokio::test]
    async fn test_many_operations() {
        let store = InMemoryCacheStore::new();
        let mut values = HashMap::new();
        values.insert("a".to_string(), json!(1));
        values.insert("b".to_string(), json!(2));
        store.set_many(values, Duration::from_secs(60)).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = store.get_many(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], json!(2));

        store.delete_many(&keys[..1]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len().await, 1);
    }
}
