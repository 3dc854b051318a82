//! Feature-service client seam.
//!
//! The feature service owns the authoritative flag configuration; the
//! gateway and the persister only reach it on cache misses and enrichment
//! fallbacks.

use crate::cache::SegmentUsersCache;
use crate::evaluator::{SegmentsError, SegmentsProvider};
use crate::model::{Feature, SegmentUsers, User, UserEvaluations};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not found")]
    NotFound,
    #[error("Feature service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait FeatureClient: Send + Sync {
    async fn list_features(&self, environment_namespace: &str) -> Result<Vec<Feature>, ClientError>;

    async fn list_segment_users(
        &self,
        environment_namespace: &str,
        segment_id: &str,
    ) -> Result<SegmentUsers, ClientError>;

    /// Server-side evaluation, used by the persister to enrich goal events
    /// from SDKs that never stored their evaluations.
    async fn evaluate_features(
        &self,
        environment_namespace: &str,
        user: &User,
        tag: &str,
    ) -> Result<UserEvaluations, ClientError>;
}

#[derive(Serialize)]
struct ListFeaturesRequest<'a> {
    environment_namespace: &'a str,
}

#[derive(Deserialize)]
struct ListFeaturesResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ListSegmentUsersRequest<'a> {
    environment_namespace: &'a str,
    segment_id: &'a str,
}

#[derive(Deserialize)]
struct ListSegmentUsersResponse {
    #[serde(default)]
    users: Vec<crate::model::SegmentUser>,
}

#[derive(Serialize)]
struct EvaluateFeaturesRequest<'a> {
    environment_namespace: &'a str,
    user: &'a User,
    tag: &'a str,
}

#[derive(Deserialize)]
struct EvaluateFeaturesResponse {
    user_evaluations: UserEvaluations,
}

/// HTTP client for the feature service.
pub struct HttpFeatureClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeatureClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Resp>()
                .await
                .map_err(|e| ClientError::Unavailable(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            status => Err(ClientError::Unavailable(format!(
                "HTTP {status} from {url}"
            ))),
        }
    }
}

#[async_trait]
impl FeatureClient for HttpFeatureClient {
    async fn list_features(&self, environment_namespace: &str) -> Result<Vec<Feature>, ClientError> {
        let response: ListFeaturesResponse = self
            .post_json(
                "/v1/features/list",
                &ListFeaturesRequest {
                    environment_namespace,
                },
            )
            .await?;
        Ok(response.features)
    }

    async fn list_segment_users(
        &self,
        environment_namespace: &str,
        segment_id: &str,
    ) -> Result<SegmentUsers, ClientError> {
        let response: ListSegmentUsersResponse = self
            .post_json(
                "/v1/segment_users/list",
                &ListSegmentUsersRequest {
                    environment_namespace,
                    segment_id,
                },
            )
            .await?;
        Ok(SegmentUsers {
            segment_id: segment_id.to_string(),
            users: response.users,
        })
    }

    async fn evaluate_features(
        &self,
        environment_namespace: &str,
        user: &User,
        tag: &str,
    ) -> Result<UserEvaluations, ClientError> {
        let response: EvaluateFeaturesResponse = self
            .post_json(
                "/v1/features/evaluate",
                &EvaluateFeaturesRequest {
                    environment_namespace,
                    user,
                    tag,
                },
            )
            .await?;
        Ok(response.user_evaluations)
    }
}

/// The gateway's [`SegmentsProvider`]: segment cache first, then the
/// feature service, writing fetched lists back through the cache.
pub struct CachingSegmentsProvider {
    cache: Arc<SegmentUsersCache>,
    client: Arc<dyn FeatureClient>,
    environment_namespace: String,
}

impl CachingSegmentsProvider {
    pub fn new(
        cache: Arc<SegmentUsersCache>,
        client: Arc<dyn FeatureClient>,
        environment_namespace: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            client,
            environment_namespace: environment_namespace.into(),
        }
    }
}

#[async_trait]
impl SegmentsProvider for CachingSegmentsProvider {
    async fn segment_users(&self, segment_id: &str) -> Result<Arc<SegmentUsers>, SegmentsError> {
        if let Ok(users) = self.cache.get(&self.environment_namespace, segment_id).await {
            return Ok(users);
        }
        let users = self
            .client
            .list_segment_users(&self.environment_namespace, segment_id)
            .await
            .map_err(|e| SegmentsError::Fetch(e.to_string()))?;
        self.cache
            .put(&self.environment_namespace, users.clone())
            .await;
        Ok(Arc::new(users))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SegmentUser, SegmentUserState};
    use parking_lot::Mutex;
    use shared::cache::InMemoryRemoteCache;
    use std::time::Duration;

    struct FakeFeatureClient {
        segment_users: Mutex<Vec<SegmentUsers>>,
        list_calls: Mutex<usize>,
    }

    #[async_trait]
    impl FeatureClient for FakeFeatureClient {
        async fn list_features(&self, _env: &str) -> Result<Vec<Feature>, ClientError> {
            Ok(vec![])
        }

        async fn list_segment_users(
            &self,
            _env: &str,
            segment_id: &str,
        ) -> Result<SegmentUsers, ClientError> {
            *self.list_calls.lock() += 1;
            self.segment_users
                .lock()
                .iter()
                .find(|s| s.segment_id == segment_id)
                .cloned()
                .ok_or(ClientError::NotFound)
        }

        async fn evaluate_features(
            &self,
            _env: &str,
            _user: &User,
            _tag: &str,
        ) -> Result<UserEvaluations, ClientError> {
            Err(ClientError::Unavailable("not implemented".into()))
        }
    }

    fn segment(segment_id: &str, user_id: &str) -> SegmentUsers {
        SegmentUsers {
            segment_id: segment_id.into(),
            users: vec![SegmentUser {
                segment_id: segment_id.into(),
                user_id: user_id.into(),
                state: SegmentUserState::Included,
                deleted: false,
            }],
        }
    }

    #[tokio::test]
    async fn cache_miss_fetches_from_the_service_and_backfills() {
        let cache = Arc::new(SegmentUsersCache::new(
            Arc::new(InMemoryRemoteCache::new()),
            Duration::from_secs(60),
        ));
        let client = Arc::new(FakeFeatureClient {
            segment_users: Mutex::new(vec![segment("segment-id", "user-1")]),
            list_calls: Mutex::new(0),
        });
        let provider =
            CachingSegmentsProvider::new(cache.clone(), client.clone(), "ns0");

        let users = provider.segment_users("segment-id").await.unwrap();
        assert!(users.contains("user-1"));
        assert_eq!(*client.list_calls.lock(), 1);

        // Second lookup is served from the cache.
        provider.segment_users("segment-id").await.unwrap();
        assert_eq!(*client.list_calls.lock(), 1);
        assert!(cache.get("ns0", "segment-id").await.is_ok());
    }

    #[tokio::test]
    async fn fetch_errors_propagate_without_an_empty_fallback() {
        let cache = Arc::new(SegmentUsersCache::new(
            Arc::new(InMemoryRemoteCache::new()),
            Duration::from_secs(60),
        ));
        let client = Arc::new(FakeFeatureClient {
            segment_users: Mutex::new(vec![]),
            list_calls: Mutex::new(0),
        });
        let provider = CachingSegmentsProvider::new(cache, client, "ns0");

        assert!(provider.segment_users("segment-id").await.is_err());
    }
}
