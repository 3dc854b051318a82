//! Hand-written doubles for the gateway's collaborators.

use crate::account::{AccountClient, AccountClientError, ApiKey, ApiKeyRole, EnvironmentApiKey};
use crate::service::{GatewayOptions, GatewayPublishers, GatewayService};
use async_trait::async_trait;
use chrono::Utc;
use feature::client::{ClientError, FeatureClient};
use feature::model::{Feature, SegmentUsers, User, UserEvaluations};
use feature::storage::{InMemoryUserEvaluationsStorage, StorageError, UserEvaluationsStorage};
use parking_lot::Mutex;
use shared::cache::InMemoryRemoteCache;
use shared::event::Event;
use shared::pubsub::{PublishError, Publisher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn sdk_api_key(environment_namespace: &str) -> EnvironmentApiKey {
    EnvironmentApiKey {
        environment_namespace: environment_namespace.into(),
        api_key: ApiKey {
            id: "id-0".into(),
            role: ApiKeyRole::Sdk,
            disabled: false,
        },
        environment_disabled: false,
    }
}

pub fn goal_event_value() -> serde_json::Value {
    serde_json::json!({
        "type": "goal",
        "timestamp": Utc::now().timestamp(),
        "goal_id": "goal-id",
        "user_id": "user-1",
        "value": 1.0,
        "tag": "test",
        "source_id": "IOS",
    })
}

pub fn evaluation_event_value() -> serde_json::Value {
    serde_json::json!({
        "type": "evaluation",
        "timestamp": Utc::now().timestamp(),
        "feature_id": "feature-a",
        "feature_version": 1,
        "user_id": "user-1",
        "variation_id": "variation-a",
        "tag": "test",
        "source_id": "IOS",
    })
}

pub fn metrics_event_value() -> serde_json::Value {
    serde_json::json!({
        "type": "metrics",
        "timestamp": Utc::now().timestamp(),
        "event": {"type": "timeout_error_count", "tag": "test"},
    })
}

/// Account service double: one known key, or a configured failure.
struct StubAccountClient {
    keys: HashMap<String, EnvironmentApiKey>,
    unavailable: bool,
}

#[async_trait]
impl AccountClient for StubAccountClient {
    async fn get_environment_api_key(
        &self,
        api_key_id: &str,
    ) -> Result<EnvironmentApiKey, AccountClientError> {
        if self.unavailable {
            return Err(AccountClientError::Unavailable("stub outage".into()));
        }
        self.keys
            .get(api_key_id)
            .cloned()
            .ok_or(AccountClientError::NotFound)
    }
}

/// Feature service double with call counting.
pub struct StubFeatureClient {
    features: Vec<Feature>,
    segment_users: Vec<SegmentUsers>,
    unavailable: bool,
    pub list_features_calls: AtomicUsize,
}

#[async_trait]
impl FeatureClient for StubFeatureClient {
    async fn list_features(&self, _env: &str) -> Result<Vec<Feature>, ClientError> {
        self.list_features_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ClientError::Unavailable("stub outage".into()));
        }
        Ok(self.features.clone())
    }

    async fn list_segment_users(
        &self,
        _env: &str,
        segment_id: &str,
    ) -> Result<SegmentUsers, ClientError> {
        if self.unavailable {
            return Err(ClientError::Unavailable("stub outage".into()));
        }
        self.segment_users
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
        Err(ClientError::Unavailable("not backed by a stub".into()))
    }
}

/// Publisher double that records every published event, optionally failing.
pub struct RecordingPublisher {
    pub events: Mutex<Vec<Event>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new(fail: bool) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail,
        }
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Unavailable("stub outage".into()));
        }
        self.events.lock().push(event);
        Ok(())
    }

    async fn publish_multi(&self, events: &[Event]) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::Unavailable("stub outage".into()));
        }
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

struct FailingStorage;

#[async_trait]
impl UserEvaluationsStorage for FailingStorage {
    async fn upsert_user_evaluation(
        &self,
        _evaluation: &feature::model::Evaluation,
        _env: &str,
        _tag: &str,
    ) -> Result<(), StorageError> {
        Err(StorageError::Internal("storage: internal".into()))
    }

    async fn get_user_evaluations(
        &self,
        _user_id: &str,
        _env: &str,
        _tag: &str,
    ) -> Result<Vec<feature::model::Evaluation>, StorageError> {
        Err(StorageError::Internal("storage: internal".into()))
    }
}

pub struct ServiceBuilder {
    api_keys: HashMap<String, EnvironmentApiKey>,
    features: Vec<Feature>,
    segment_users: Vec<SegmentUsers>,
    account_unavailable: bool,
    features_unavailable: bool,
    failing_storage: bool,
    failing_publishers: Vec<&'static str>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self {
            api_keys: HashMap::new(),
            features: Vec::new(),
            segment_users: Vec::new(),
            account_unavailable: false,
            features_unavailable: false,
            failing_storage: false,
            failing_publishers: Vec::new(),
        }
    }

    /// Registers the default `"test-key"` credential.
    pub fn api_key(mut self, key: EnvironmentApiKey) -> Self {
        self.api_keys.insert("test-key".into(), key);
        self
    }

    pub fn features(mut self, features: Vec<Feature>) -> Self {
        self.features = features;
        self
    }

    pub fn segment_users(mut self, segment_users: Vec<SegmentUsers>) -> Self {
        self.segment_users = segment_users;
        self
    }

    pub fn account_unavailable(mut self) -> Self {
        self.account_unavailable = true;
        self
    }

    pub fn features_unavailable(mut self) -> Self {
        self.features_unavailable = true;
        self
    }

    pub fn failing_storage(mut self) -> Self {
        self.failing_storage = true;
        self
    }

    pub fn failing_publisher(mut self, topic: &'static str) -> Self {
        self.failing_publishers.push(topic);
        self
    }

    /// For tests that only need the service itself.
    pub fn build_service(self) -> GatewayService {
        self.build().service
    }

    pub fn build(self) -> TestService {
        let feature_client = Arc::new(StubFeatureClient {
            features: self.features,
            segment_users: self.segment_users,
            unavailable: self.features_unavailable,
            list_features_calls: AtomicUsize::new(0),
        });
        let storage = Arc::new(InMemoryUserEvaluationsStorage::new());

        let publisher = |topic: &str| {
            Arc::new(RecordingPublisher::new(
                self.failing_publishers.iter().any(|t| *t == topic),
            ))
        };
        let goal = publisher("goal");
        let goal_batch = publisher("goal_batch");
        let evaluation = publisher("evaluation");
        let metrics = publisher("metrics");
        let user = publisher("user");

        let storage_impl: Arc<dyn UserEvaluationsStorage> = if self.failing_storage {
            Arc::new(FailingStorage)
        } else {
            storage.clone()
        };

        let service = GatewayService::new(
            Arc::new(StubAccountClient {
                keys: self.api_keys,
                unavailable: self.account_unavailable,
            }),
            feature_client.clone(),
            storage_impl,
            GatewayPublishers {
                goal: goal.clone(),
                goal_batch: goal_batch.clone(),
                evaluation: evaluation.clone(),
                metrics: metrics.clone(),
                user: user.clone(),
            },
            Arc::new(InMemoryRemoteCache::new()),
            GatewayOptions::default(),
        );

        TestService {
            service,
            feature_client,
            storage,
            publishers: HashMap::from([
                ("goal", goal),
                ("goal_batch", goal_batch),
                ("evaluation", evaluation),
                ("metrics", metrics),
                ("user", user),
            ]),
        }
    }
}

/// A built service plus handles onto its doubles for assertions.
pub struct TestService {
    service: GatewayService,
    feature_client: Arc<StubFeatureClient>,
    storage: Arc<InMemoryUserEvaluationsStorage>,
    publishers: HashMap<&'static str, Arc<RecordingPublisher>>,
}

impl TestService {
    pub fn published(&self, topic: &str) -> Vec<Event> {
        self.publishers[topic].events.lock().clone()
    }

    pub fn storage(&self) -> &InMemoryUserEvaluationsStorage {
        &self.storage
    }

    pub fn feature_client_list_calls(&self) -> usize {
        self.feature_client.list_features_calls.load(Ordering::SeqCst)
    }
}

impl std::ops::Deref for TestService {
    type Target = GatewayService;

    fn deref(&self) -> &Self::Target {
        &self.service
    }
}
