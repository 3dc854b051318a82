//! The gateway service: admission, evaluation, and telemetry ingestion.

use crate::account::{AccountClient, AccountClientError, ApiKeyRole, EnvironmentApiKey,
    EnvironmentApiKeyCache};
use crate::errors::GatewayError;
use crate::metrics_defs::REGISTER_EVENTS_HANDLED;
use chrono::Utc;
use feature::cache::{FeaturesCache, SegmentUsersCache};
use feature::client::{CachingSegmentsProvider, FeatureClient};
use feature::evaluator::Evaluator;
use feature::model::{Evaluation, Feature, Features, User, UserEvaluations};
use feature::storage::UserEvaluationsStorage;
use feature::ueid;
use serde::{Deserialize, Serialize};
use shared::cache::RemoteCache;
use shared::event::{Event, EventPayload, SourceId, UserEvent};
use shared::pubsub::Publisher;
use shared::shutdown::ShutdownHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tag recorded for evaluation events from SDKs that predate tagging.
const TAGLESS_EVENT_TAG: &str = "none";

/// Client clock drift tolerated on event timestamps, both directions.
const MAX_TIMESTAMP_DRIFT_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub api_key_cache_ttl: Duration,
    pub features_cache_ttl: Duration,
    pub segment_users_cache_ttl: Duration,
    pub publish_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            api_key_cache_ttl: Duration::from_secs(300),
            features_cache_ttl: Duration::from_secs(60),
            segment_users_cache_ttl: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// One publisher per telemetry topic; all shared and thread-safe.
#[derive(Clone)]
pub struct GatewayPublishers {
    pub goal: Arc<dyn Publisher>,
    pub goal_batch: Arc<dyn Publisher>,
    pub evaluation: Arc<dyn Publisher>,
    pub metrics: Arc<dyn Publisher>,
    pub user: Arc<dyn Publisher>,
}

/// Per-request context assembled by the transport layer from the
/// `authorization` metadata slot and the connection's cancellation signal.
pub struct RequestContext {
    pub api_key: Option<String>,
    pub cancel: ShutdownHandle,
}

impl RequestContext {
    pub fn new(api_key: Option<String>, cancel: ShutdownHandle) -> Self {
        Self { api_key, cancel }
    }

    pub fn with_api_key(api_key: &str) -> Self {
        Self {
            api_key: Some(api_key.to_string()),
            cancel: ShutdownHandle::never(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserEvaluationsState {
    Queued,
    Partial,
    Full,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetEvaluationsRequest {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub user_evaluations_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetEvaluationsResponse {
    pub state: UserEvaluationsState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluations: Option<UserEvaluations>,
    pub user_evaluations_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetEvaluationRequest {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub feature_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetEvaluationResponse {
    pub evaluation: Evaluation,
}

/// An event as received from the SDK: the payload stays raw so one
/// malformed event cannot fail the whole call.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub event: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterEventsRequest {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterEventsError {
    pub retriable: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegisterEventsResponse {
    pub errors: HashMap<String, RegisterEventsError>,
}

pub struct GatewayService {
    account_client: Arc<dyn AccountClient>,
    feature_client: Arc<dyn FeatureClient>,
    user_evaluations_storage: Arc<dyn UserEvaluationsStorage>,
    publishers: GatewayPublishers,
    features_cache: FeaturesCache,
    segment_users_cache: Arc<SegmentUsersCache>,
    environment_api_key_cache: EnvironmentApiKeyCache,
    evaluator: Evaluator,
    options: GatewayOptions,
}

impl GatewayService {
    pub fn new(
        account_client: Arc<dyn AccountClient>,
        feature_client: Arc<dyn FeatureClient>,
        user_evaluations_storage: Arc<dyn UserEvaluationsStorage>,
        publishers: GatewayPublishers,
        remote_cache: Arc<dyn RemoteCache>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            account_client,
            feature_client,
            user_evaluations_storage,
            publishers,
            features_cache: FeaturesCache::new(remote_cache.clone(), options.features_cache_ttl),
            segment_users_cache: Arc::new(SegmentUsersCache::new(
                remote_cache.clone(),
                options.segment_users_cache_ttl,
            )),
            environment_api_key_cache: EnvironmentApiKeyCache::new(
                remote_cache,
                options.api_key_cache_ttl,
            ),
            evaluator: Evaluator::new(),
            options,
        }
    }

    // Admission: cancellation first, then API key resolution, then the
    // role/disabled checks.
    async fn check_request(
        &self,
        ctx: &RequestContext,
        required_role: ApiKeyRole,
    ) -> Result<Arc<EnvironmentApiKey>, GatewayError> {
        if ctx.cancel.is_cancelled() {
            return Err(GatewayError::ContextCanceled);
        }
        let env_api_key = self.find_environment_api_key(ctx).await?;
        check_environment_api_key(&env_api_key, required_role)?;
        Ok(env_api_key)
    }

    async fn find_environment_api_key(
        &self,
        ctx: &RequestContext,
    ) -> Result<Arc<EnvironmentApiKey>, GatewayError> {
        let api_key_id = ctx
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(GatewayError::MissingApiKey)?;

        if let Ok(key) = self.environment_api_key_cache.get(api_key_id).await {
            return Ok(key);
        }
        let key = self
            .account_client
            .get_environment_api_key(api_key_id)
            .await
            .map_err(|err| match err {
                AccountClientError::NotFound => GatewayError::InvalidApiKey,
                AccountClientError::Unavailable(reason) => {
                    tracing::error!(error = %reason, "Failed to get environment API key");
                    GatewayError::Internal
                }
            })?;
        self.environment_api_key_cache
            .put(api_key_id, key.clone())
            .await;
        Ok(Arc::new(key))
    }

    pub async fn get_evaluations(
        &self,
        ctx: &RequestContext,
        request: GetEvaluationsRequest,
    ) -> Result<GetEvaluationsResponse, GatewayError> {
        let env_api_key = self.check_request(ctx, ApiKeyRole::Sdk).await?;
        let environment_namespace = env_api_key.environment_namespace.clone();

        let user = validate_user(&request.tag, request.user.as_ref())?;
        self.publish_user_event(user, &request.tag, &environment_namespace);

        let features = self.get_features(&environment_namespace).await?;
        if features.features.is_empty() {
            return Ok(GetEvaluationsResponse {
                state: UserEvaluationsState::Full,
                evaluations: None,
                user_evaluations_id: String::new(),
            });
        }

        let filtered: Vec<Feature> = features
            .features
            .iter()
            .filter(|f| f.matches_tag(&request.tag))
            .cloned()
            .collect();
        let user_evaluations_id = ueid::user_evaluations_id(&user.id, &user.data, &filtered);

        // The SDK already holds this exact set; skip the payload.
        if !request.user_evaluations_id.is_empty()
            && request.user_evaluations_id == user_evaluations_id
        {
            return Ok(GetEvaluationsResponse {
                state: UserEvaluationsState::Full,
                evaluations: None,
                user_evaluations_id,
            });
        }

        let evaluations = self
            .evaluate(&filtered, user, &request.tag, &environment_namespace)
            .await?;
        Ok(GetEvaluationsResponse {
            state: UserEvaluationsState::Full,
            evaluations: Some(evaluations),
            user_evaluations_id,
        })
    }

    pub async fn get_evaluation(
        &self,
        ctx: &RequestContext,
        request: GetEvaluationRequest,
    ) -> Result<GetEvaluationResponse, GatewayError> {
        let env_api_key = self.check_request(ctx, ApiKeyRole::Sdk).await?;
        let environment_namespace = env_api_key.environment_namespace.clone();

        let user = validate_user(&request.tag, request.user.as_ref())?;
        if request.feature_id.is_empty() {
            return Err(GatewayError::FeatureIdRequired);
        }
        self.publish_user_event(user, &request.tag, &environment_namespace);

        let features = self.get_features(&environment_namespace).await?;
        let filtered: Vec<Feature> = features
            .features
            .iter()
            .filter(|f| f.matches_tag(&request.tag))
            .cloned()
            .collect();

        let evaluations = self
            .evaluate(&filtered, user, &request.tag, &environment_namespace)
            .await?;
        let evaluation = evaluations
            .evaluations
            .into_iter()
            .find(|e| e.feature_id == request.feature_id)
            .ok_or(GatewayError::FeatureNotFound)?;

        self.user_evaluations_storage
            .upsert_user_evaluation(&evaluation, &environment_namespace, &request.tag)
            .await
            .map_err(|err| {
                tracing::error!(
                    error = %err,
                    %environment_namespace,
                    feature_id = %request.feature_id,
                    "Failed to upsert user evaluation"
                );
                GatewayError::Internal
            })?;

        Ok(GetEvaluationResponse { evaluation })
    }

    pub async fn register_events(
        &self,
        ctx: &RequestContext,
        request: RegisterEventsRequest,
    ) -> Result<RegisterEventsResponse, GatewayError> {
        let env_api_key = self.check_request(ctx, ApiKeyRole::Sdk).await?;
        let environment_namespace = env_api_key.environment_namespace.clone();

        if request.events.is_empty() {
            return Err(GatewayError::MissingEvents);
        }
        if request.events.iter().any(|e| e.id.is_empty()) {
            return Err(GatewayError::MissingEventId);
        }

        let now = Utc::now().timestamp();
        let mut errors: HashMap<String, RegisterEventsError> = HashMap::new();
        let mut goal_events = Vec::new();
        let mut goal_batch_events = Vec::new();
        let mut evaluation_events = Vec::new();
        let mut metrics_events = Vec::new();

        for raw in &request.events {
            let payload = match serde_json::from_value::<EventPayload>(raw.event.clone()) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(id = %raw.id, error = %err, "Received an event of unknown type");
                    metrics::counter!(REGISTER_EVENTS_HANDLED.name, "code" => "invalid_type")
                        .increment(1);
                    errors.insert(raw.id.clone(), non_retriable("Invalid message type"));
                    continue;
                }
            };

            if let Some(timestamp) = client_timestamp(&payload) {
                if (now - timestamp).abs() > MAX_TIMESTAMP_DRIFT_SECS {
                    metrics::counter!(REGISTER_EVENTS_HANDLED.name, "code" => "invalid_timestamp")
                        .increment(1);
                    errors.insert(raw.id.clone(), non_retriable("Invalid timestamp"));
                    continue;
                }
            }

            let envelope = |payload| Event {
                id: raw.id.clone(),
                environment_namespace: environment_namespace.clone(),
                payload,
            };
            match payload {
                EventPayload::Evaluation(evaluation_event) => {
                    let (evaluation, tag) = conv_to_evaluation(&evaluation_event);
                    if let Err(err) = self
                        .user_evaluations_storage
                        .upsert_user_evaluation(&evaluation, &environment_namespace, &tag)
                        .await
                    {
                        tracing::error!(
                            error = %err,
                            id = %raw.id,
                            %environment_namespace,
                            "Failed to upsert user evaluation"
                        );
                        errors.insert(
                            raw.id.clone(),
                            retriable("Failed to upsert user evaluation"),
                        );
                        continue;
                    }
                    evaluation_events.push(envelope(EventPayload::Evaluation(evaluation_event)));
                }
                EventPayload::Goal(goal_event) => {
                    goal_events.push(envelope(EventPayload::Goal(goal_event)));
                }
                EventPayload::GoalBatch(goal_batch_event) => {
                    goal_batch_events.push(envelope(EventPayload::GoalBatch(goal_batch_event)));
                }
                EventPayload::Metrics(metrics_event) => {
                    metrics_events.push(envelope(EventPayload::Metrics(metrics_event)));
                }
                // SDKs never send user events; the gateway derives them.
                EventPayload::User(_) => {
                    errors.insert(raw.id.clone(), non_retriable("Invalid message type"));
                }
            }
        }

        let batches = [
            (&self.publishers.goal, goal_events),
            (&self.publishers.goal_batch, goal_batch_events),
            (&self.publishers.evaluation, evaluation_events),
            (&self.publishers.metrics, metrics_events),
        ];
        for (publisher, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            if let Err(err) = publisher.publish_multi(&batch).await {
                tracing::error!(error = %err, %environment_namespace, "Failed to publish events");
                for event in &batch {
                    errors.insert(event.id.clone(), retriable("Failed to publish event"));
                }
            }
        }

        Ok(RegisterEventsResponse { errors })
    }

    async fn get_features(
        &self,
        environment_namespace: &str,
    ) -> Result<Arc<Features>, GatewayError> {
        if let Ok(features) = self.features_cache.get(environment_namespace).await {
            return Ok(features);
        }
        let features = self
            .feature_client
            .list_features(environment_namespace)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, environment_namespace, "Failed to list features");
                GatewayError::Internal
            })?;
        let features = Features { features };
        self.features_cache
            .put(environment_namespace, features.clone())
            .await;
        Ok(Arc::new(features))
    }

    async fn evaluate(
        &self,
        features: &[Feature],
        user: &User,
        tag: &str,
        environment_namespace: &str,
    ) -> Result<UserEvaluations, GatewayError> {
        let segments = CachingSegmentsProvider::new(
            self.segment_users_cache.clone(),
            self.feature_client.clone(),
            environment_namespace,
        );
        self.evaluator
            .evaluate(features, &segments, user, tag)
            .await
            .map_err(|err| {
                tracing::error!(
                    error = %err,
                    environment_namespace,
                    user_id = %user.id,
                    tag,
                    "Failed to evaluate features"
                );
                GatewayError::Internal
            })
    }

    /// Best-effort last-seen marker; failures never surface to the SDK.
    fn publish_user_event(&self, user: &User, tag: &str, environment_namespace: &str) {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            environment_namespace: environment_namespace.to_string(),
            payload: EventPayload::User(UserEvent {
                user_id: user.id.clone(),
                source_id: SourceId::Gateway,
                tag: tag.to_string(),
                last_seen: Utc::now().timestamp(),
                data: user.data.clone(),
            }),
        };
        let publisher = self.publishers.user.clone();
        let timeout = self.options.publish_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, publisher.publish(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "Failed to publish user event"),
                Err(_) => tracing::warn!("Timed out publishing user event"),
            }
        });
    }
}

fn check_environment_api_key(
    key: &EnvironmentApiKey,
    required_role: ApiKeyRole,
) -> Result<(), GatewayError> {
    if key.api_key.role != required_role {
        return Err(GatewayError::BadRole);
    }
    if key.api_key.disabled || key.environment_disabled {
        return Err(GatewayError::DisabledApiKey);
    }
    Ok(())
}

fn validate_user<'a>(tag: &str, user: Option<&'a User>) -> Result<&'a User, GatewayError> {
    if tag.is_empty() {
        return Err(GatewayError::TagRequired);
    }
    let user = user.ok_or(GatewayError::UserRequired)?;
    if user.id.is_empty() {
        return Err(GatewayError::UserIdRequired);
    }
    Ok(user)
}

/// Timestamp supplied by the SDK, for the event kinds that carry one.
fn client_timestamp(payload: &EventPayload) -> Option<i64> {
    match payload {
        EventPayload::Evaluation(e) => Some(e.timestamp),
        EventPayload::Goal(e) => Some(e.timestamp),
        EventPayload::Metrics(e) => Some(e.timestamp),
        EventPayload::GoalBatch(_) | EventPayload::User(_) => None,
    }
}

/// Converts a reported evaluation event into the stored evaluation plus the
/// storage tag (`"none"` for tagless legacy SDKs).
fn conv_to_evaluation(event: &shared::event::EvaluationEvent) -> (Evaluation, String) {
    let evaluation = Evaluation {
        id: ueid::evaluation_id(&event.feature_id, event.feature_version, &event.user_id),
        feature_id: event.feature_id.clone(),
        feature_version: event.feature_version,
        user_id: event.user_id.clone(),
        variation_id: event.variation_id.clone(),
        reason: event.reason.clone(),
    };
    let tag = if event.tag.is_empty() {
        TAGLESS_EVENT_TAG.to_string()
    } else {
        event.tag.clone()
    };
    (evaluation, tag)
}

fn retriable(message: &str) -> RegisterEventsError {
    RegisterEventsError {
        retriable: true,
        message: message.to_string(),
    }
}

fn non_retriable(message: &str) -> RegisterEventsError {
    RegisterEventsError {
        retriable: false,
        message: message.to_string(),
    }
}
