//! Layered read-through cache core.
//!
//! Two tiers: a bounded process-local cache with TTL, and a shared
//! cross-process store behind [`RemoteCache`]. Every failure other than
//! `NotFound` degrades to a miss so callers fall through to the
//! authoritative origin; the cache boundary never fails closed.

use async_trait::async_trait;
use moka::sync::Cache as LocalCache;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Key not found")]
    NotFound,
    #[error("Cache failure: {0}")]
    Failed(String),
}

/// Shared tier: an external key/value store. Values are opaque bytes; the
/// layered wrapper owns the serialization.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;
}

/// Local tier in front of a [`RemoteCache`], parameterized by value type.
/// Each value type gets its own instance; instances are never shared across
/// types.
pub struct LayeredCache<V> {
    local: LocalCache<String, Arc<V>>,
    remote: Arc<dyn RemoteCache>,
    ttl: Duration,
}

impl<V> LayeredCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(remote: Arc<dyn RemoteCache>, ttl: Duration, max_capacity: u64) -> Self {
        let local = LocalCache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { local, remote, ttl }
    }

    pub async fn get(&self, key: &str) -> Result<Arc<V>, CacheError> {
        if let Some(value) = self.local.get(key) {
            return Ok(value);
        }
        let bytes = match self.remote.get(key).await {
            Ok(bytes) => bytes,
            Err(CacheError::NotFound) => return Err(CacheError::NotFound),
            Err(err) => {
                tracing::warn!(key, error = %err, "shared cache read failed, treating as miss");
                return Err(CacheError::NotFound);
            }
        };
        match serde_json::from_slice::<V>(&bytes) {
            Ok(value) => {
                let value = Arc::new(value);
                self.local.insert(key.to_string(), value.clone());
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(key, error = %err, "shared cache entry is malformed, treating as miss");
                Err(CacheError::NotFound)
            }
        }
    }

    /// Writes both tiers. A shared-tier failure is logged and swallowed; the
    /// entry still serves locally until its TTL runs out.
    pub async fn put(&self, key: &str, value: V) {
        let bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(key, error = %err, "could not serialize cache entry");
                return;
            }
        };
        self.local.insert(key.to_string(), Arc::new(value));
        if let Err(err) = self.remote.put(key, bytes, self.ttl).await {
            tracing::warn!(key, error = %err, "shared cache write failed");
        }
    }
}

/// Shared-tier stand-in for tests and the single-process mode. Honors TTLs.
#[derive(Default)]
pub struct InMemoryRemoteCache {
    entries: RwLock<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl InMemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                Err(CacheError::NotFound)
            }
            Some((bytes, _)) => Ok(bytes.clone()),
            None => Err(CacheError::NotFound),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .write()
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRemote {
        inner: InMemoryRemoteCache,
        gets: AtomicUsize,
    }

    impl CountingRemote {
        fn new() -> Self {
            Self {
                inner: InMemoryRemoteCache::new(),
                gets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteCache for CountingRemote {
        async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
            self.inner.put(key, value, ttl).await
        }
    }

    struct BrokenRemote;

    #[async_trait]
    impl RemoteCache for BrokenRemote {
        async fn get(&self, _key: &str) -> Result<Vec<u8>, CacheError> {
            Err(CacheError::Failed("connection refused".into()))
        }

        async fn put(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Failed("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn local_hit_skips_the_shared_tier() {
        let remote = Arc::new(CountingRemote::new());
        let cache: LayeredCache<String> =
            LayeredCache::new(remote.clone(), Duration::from_secs(60), 100);

        cache.put("k", "v".to_string()).await;
        for _ in 0..3 {
            assert_eq!(*cache.get("k").await.unwrap(), "v");
        }
        assert_eq!(remote.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_hit_populates_the_local_tier() {
        let remote = Arc::new(CountingRemote::new());
        remote
            .put("k", serde_json::to_vec("v").unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache: LayeredCache<String> =
            LayeredCache::new(remote.clone(), Duration::from_secs(60), 100);

        assert_eq!(*cache.get("k").await.unwrap(), "v");
        assert_eq!(*cache.get("k").await.unwrap(), "v");
        assert_eq!(remote.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let cache: LayeredCache<String> = LayeredCache::new(
            Arc::new(InMemoryRemoteCache::new()),
            Duration::from_secs(60),
            100,
        );
        assert!(matches!(cache.get("k").await, Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn shared_tier_failure_degrades_to_a_miss() {
        let cache: LayeredCache<String> =
            LayeredCache::new(Arc::new(BrokenRemote), Duration::from_secs(60), 100);
        assert!(matches!(cache.get("k").await, Err(CacheError::NotFound)));

        // A put still lands locally even though the shared write fails.
        cache.put("k", "v".to_string()).await;
        assert_eq!(*cache.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn expired_remote_entries_miss() {
        let remote = InMemoryRemoteCache::new();
        remote
            .put("k", b"1".to_vec(), Duration::from_secs(0))
            .await
            .unwrap();
        assert!(matches!(remote.get("k").await, Err(CacheError::NotFound)));
    }
}
