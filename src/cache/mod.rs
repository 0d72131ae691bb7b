//! Response cache.
//!
//! Payloads are keyed by endpoint, request body and acting identity so two
//! identities never see each other's authenticated data. Entries live for the
//! configured TTL; ESI's own `expires` header does not govern cache lifetime.

use crate::auth::Identity;
use crate::errors::EsiResult;
use crate::store::CacheStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of every response cache key.
pub const CACHE_KEY_PREFIX: &str = "esi_cache_";

/// Longest key accepted by common cache backends.
pub const MAX_CACHE_KEY_LEN: usize = 249;

/// Response cache backed by the shared store.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    disabled: bool,
}

impl ResponseCache {
    /// Creates a response cache. A disabled cache never reads.
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration, disabled: bool) -> Self {
        Self {
            store,
            ttl,
            disabled,
        }
    }

    /// Returns true if caching is globally disabled.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Builds the cache key for a request.
    pub fn cache_key(endpoint: &str, body: Option<&Value>, identity: Option<&Identity>) -> String {
        let body = body.map(Value::to_string).unwrap_or_default();
        let identity = identity.map(Identity::as_str).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        hasher.update(body.as_bytes());
        hasher.update(identity.as_bytes());

        let mut key = format!("{}{}", CACHE_KEY_PREFIX, hex::encode(hasher.finalize()));
        key.truncate(MAX_CACHE_KEY_LEN);
        key
    }

    /// Reads a cached payload unless caching is disabled.
    ///
    /// Per-request bypass is the caller's decision; a bypassing caller skips
    /// the read entirely.
    pub async fn try_read(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        identity: Option<&Identity>,
    ) -> EsiResult<Option<Value>> {
        if self.disabled {
            return Ok(None);
        }
        self.store
            .get(&Self::cache_key(endpoint, body, identity))
            .await
    }

    /// Stores a payload for the configured TTL.
    ///
    /// `expires_at` is the upstream expiry of the payload. It is logged but
    /// does not shorten or extend the entry's lifetime.
    pub async fn write(
        &self,
        endpoint: &str,
        body: Option<&Value>,
        identity: Option<&Identity>,
        payload: &Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> EsiResult<()> {
        tracing::debug!(
            endpoint = endpoint,
            ttl_secs = self.ttl.as_secs(),
            upstream_expires_at = ?expires_at,
            "Caching ESI response"
        );
        self.store
            .set(
                &Self::cache_key(endpoint, body, identity),
                payload.clone(),
                self.ttl,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCacheStore;
    use serde_json::json;

    fn cache(ttl: Duration) -> ResponseCache {
        ResponseCache::new(Arc::new(InMemoryCacheStore::new()), ttl, false)
    }

    #[test]
    fn test_key_depends_on_all_parts() {
        let body = json!([1, 2, 3]);
        let base = ResponseCache::cache_key("/v1/universe/names/", Some(&body), None);

        assert!(base.starts_with(CACHE_KEY_PREFIX));
        assert!(base.len() <= MAX_CACHE_KEY_LEN);
        assert_eq!(base, ResponseCache::cache_key("/v1/universe/names/", Some(&body), None));
        assert_ne!(base, ResponseCache::cache_key("/v1/universe/names/", None, None));
        assert_ne!(
            base,
            ResponseCache::cache_key("/v1/universe/names/", Some(&body), Some(&Identity::from(1u64)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_after_write_until_ttl() {
        let cache = cache(Duration::from_secs(600));
        let identity = Identity::from(5u64);
        let payload = json!({"balance": 1234.5});

        cache
            .write("/v1/characters/5/wallet/", None, Some(&identity), &payload, None)
            .await
            .unwrap();

        let hit = cache
            .try_read("/v1/characters/5/wallet/", None, Some(&identity))
            .await
            .unwrap();
        assert_eq!(hit, Some(payload));

        let other = cache
            .try_read("/v1/characters/5/wallet/", None, None)
            .await
            .unwrap();
        assert_eq!(other, None);

        tokio::time::advance(Duration::from_secs(601)).await;
        let expired = cache
            .try_read("/v1/characters/5/wallet/", None, Some(&identity))
            .await
            .unwrap();
        assert_eq!(expired, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_expiry_does_not_govern_lifetime() {
        let cache = cache(Duration::from_secs(300));
        let already_expired = Utc::now() - chrono::Duration::minutes(5);

        cache
            .write("/v1/status/", None, None, &json!({"players": 1}), Some(already_expired))
            .await
            .unwrap();
        assert!(cache.try_read("/v1/status/", None, None).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.try_read("/v1/status/", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_skips_reads() {
        let store = Arc::new(InMemoryCacheStore::new());
        let enabled = ResponseCache::new(store.clone(), Duration::from_secs(60), false);
        enabled
            .write("/v1/status/", None, None, &json!({"players": 1}), None)
            .await
            .unwrap();

        assert!(enabled.try_read("/v1/status/", None, None).await.unwrap().is_some());

        let disabled = ResponseCache::new(store, Duration::from_secs(60), true);
        assert!(disabled.is_disabled());
        assert!(disabled.try_read("/v1/status/", None, None).await.unwrap().is_none());
    }
}
