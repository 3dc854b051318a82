//! Typed caches over the layered core. One cache type per value type; the
//! key schema is shared with the admin services that invalidate the remote
//! tier on writes.

use crate::model::{Features, SegmentUsers};
use shared::cache::{CacheError, LayeredCache, RemoteCache};
use std::sync::Arc;
use std::time::Duration;

const FEATURES_CACHE_CAPACITY: u64 = 1_000;
const SEGMENT_USERS_CACHE_CAPACITY: u64 = 10_000;

/// Per-environment flag bundle, keyed `features:{environment_namespace}`.
pub struct FeaturesCache {
    inner: LayeredCache<Features>,
}

impl FeaturesCache {
    pub fn new(remote: Arc<dyn RemoteCache>, ttl: Duration) -> Self {
        Self {
            inner: LayeredCache::new(remote, ttl, FEATURES_CACHE_CAPACITY),
        }
    }

    fn key(environment_namespace: &str) -> String {
        format!("features:{environment_namespace}")
    }

    pub async fn get(&self, environment_namespace: &str) -> Result<Arc<Features>, CacheError> {
        self.inner.get(&Self::key(environment_namespace)).await
    }

    pub async fn put(&self, environment_namespace: &str, features: Features) {
        self.inner
            .put(&Self::key(environment_namespace), features)
            .await
    }
}

/// Segment membership lists, keyed
/// `segment_users:{environment_namespace}:{segment_id}`.
pub struct SegmentUsersCache {
    inner: LayeredCache<SegmentUsers>,
}

impl SegmentUsersCache {
    pub fn new(remote: Arc<dyn RemoteCache>, ttl: Duration) -> Self {
        Self {
            inner: LayeredCache::new(remote, ttl, SEGMENT_USERS_CACHE_CAPACITY),
        }
    }

    fn key(environment_namespace: &str, segment_id: &str) -> String {
        format!("segment_users:{environment_namespace}:{segment_id}")
    }

    pub async fn get(
        &self,
        environment_namespace: &str,
        segment_id: &str,
    ) -> Result<Arc<SegmentUsers>, CacheError> {
        self.inner
            .get(&Self::key(environment_namespace, segment_id))
            .await
    }

    pub async fn put(&self, environment_namespace: &str, users: SegmentUsers) {
        let key = Self::key(environment_namespace, &users.segment_id);
        self.inner.put(&key, users).await
    }
}
