//! Hand-written doubles for the persister's collaborators.

use crate::datastore::{DatastoreWriter, RowStore, WriteError};
use async_trait::async_trait;
use feature::client::{ClientError, FeatureClient};
use feature::model::{Evaluation, Feature, Reason, ReasonType, SegmentUsers, User, UserEvaluations};
use parking_lot::Mutex;
use serde_json::Value;
use shared::event::{Event, EventPayload, GoalEvent, SourceId, UserEvent};
use shared::pubsub::{Acker, PulledMessage, Puller};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

pub fn user_event(id: &str) -> Event {
    Event {
        id: id.into(),
        environment_namespace: "ns0".into(),
        payload: EventPayload::User(UserEvent {
            user_id: "user-1".into(),
            source_id: SourceId::Gateway,
            tag: "ios".into(),
            last_seen: 1_700_000_000,
            ..Default::default()
        }),
    }
}

pub fn goal_event(user_id: &str, tag: &str, source_id: SourceId) -> Event {
    Event {
        id: "goal-envelope".into(),
        environment_namespace: "ns0".into(),
        payload: EventPayload::Goal(GoalEvent {
            timestamp: 1_700_000_000,
            goal_id: "signup".into(),
            user_id: user_id.into(),
            value: 1.0,
            user: Some(User {
                id: user_id.into(),
                ..Default::default()
            }),
            tag: tag.into(),
            source_id,
            ..Default::default()
        }),
    }
}

pub fn evaluation(feature_id: &str, feature_version: u32, user_id: &str) -> Evaluation {
    Evaluation {
        id: format!("{feature_id}:{feature_version}:{user_id}"),
        feature_id: feature_id.into(),
        feature_version,
        user_id: user_id.into(),
        variation_id: "variation-a".into(),
        reason: Some(Reason {
            reason_type: ReasonType::Default,
            rule_id: None,
        }),
    }
}

/// Records every settle outcome as `(batch_id, positive)`.
#[derive(Clone, Default)]
pub struct AckLog {
    entries: Arc<Mutex<Vec<(String, bool)>>>,
}

struct LogAcker {
    log: AckLog,
    id: String,
}

impl Acker for LogAcker {
    fn settle(&self, positive: bool) {
        self.log.entries.lock().push((self.id.clone(), positive));
    }
}

impl AckLog {
    pub fn entries(&self) -> Vec<(String, bool)> {
        self.entries.lock().clone()
    }

    pub fn acked(&self) -> usize {
        self.entries.lock().iter().filter(|(_, p)| *p).count()
    }

    pub fn nacked(&self) -> usize {
        self.entries.lock().iter().filter(|(_, p)| !*p).count()
    }

    fn acker(&self, id: &str) -> Arc<dyn Acker> {
        Arc::new(LogAcker {
            log: self.clone(),
            id: id.to_string(),
        })
    }
}

pub fn message(id: &str, event: &Event, log: &AckLog) -> PulledMessage {
    PulledMessage::new(
        id,
        HashMap::from([("id".to_string(), id.to_string())]),
        event.encode(),
        log.acker(id),
    )
}

pub fn message_without_id(event: &Event, log: &AckLog) -> PulledMessage {
    PulledMessage::new("unattributed", HashMap::new(), event.encode(), log.acker("unattributed"))
}

pub fn raw_message(id: &str, data: Vec<u8>, log: &AckLog) -> PulledMessage {
    PulledMessage::new(
        id,
        HashMap::from([("id".to_string(), id.to_string())]),
        data,
        log.acker(id),
    )
}

/// Test-controlled subscription.
pub struct QueuePuller {
    tx: Mutex<Option<mpsc::UnboundedSender<PulledMessage>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<PulledMessage>>,
}

impl QueuePuller {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        })
    }

    pub fn push(&self, message: PulledMessage) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(message);
        }
    }

    pub fn close(&self) {
        self.tx.lock().take();
    }
}

#[async_trait]
impl Puller for QueuePuller {
    async fn pull(&self) -> Option<PulledMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Warehouse sink double: captures writes, returns a configured failure map.
#[derive(Default)]
pub struct StubDatastore {
    fails: HashMap<String, bool>,
    writes: Mutex<Vec<(String, HashMap<String, Value>)>>,
}

impl StubDatastore {
    pub fn with_fails(fails: HashMap<String, bool>) -> Self {
        Self {
            fails,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<(String, HashMap<String, Value>)> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl DatastoreWriter for StubDatastore {
    async fn write(
        &self,
        environment_namespace: &str,
        records: HashMap<String, Value>,
    ) -> Result<HashMap<String, bool>, WriteError> {
        let fails = records
            .keys()
            .filter_map(|id| self.fails.get(id).map(|repeatable| (id.clone(), *repeatable)))
            .collect();
        self.writes
            .lock()
            .push((environment_namespace.to_string(), records));
        Ok(fails)
    }
}

/// Row store double: captures typed rows, optionally failing every write.
#[derive(Default)]
pub struct StubRowStore {
    failing: AtomicBool,
    goal_rows: Mutex<Vec<(String, Vec<String>)>>,
    other_rows: Mutex<Vec<String>>,
}

impl StubRowStore {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn goal_rows(&self) -> Vec<(String, Vec<String>)> {
        self.goal_rows.lock().clone()
    }

    fn check(&self) -> Result<(), WriteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WriteError::Unavailable("row store outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for StubRowStore {
    async fn create_evaluation_event(
        &self,
        _event: &shared::event::EvaluationEvent,
        id: &str,
        _env: &str,
    ) -> Result<(), WriteError> {
        self.check()?;
        self.other_rows.lock().push(id.to_string());
        Ok(())
    }

    async fn create_goal_event(
        &self,
        _event: &GoalEvent,
        id: &str,
        _env: &str,
        evaluations: &[String],
    ) -> Result<(), WriteError> {
        self.check()?;
        self.goal_rows
            .lock()
            .push((id.to_string(), evaluations.to_vec()));
        Ok(())
    }

    async fn create_user_event(
        &self,
        _event: &UserEvent,
        id: &str,
        _env: &str,
    ) -> Result<(), WriteError> {
        self.check()?;
        self.other_rows.lock().push(id.to_string());
        Ok(())
    }
}

/// Feature service double for the enrichment fallback.
#[derive(Default)]
pub struct StubFeatureClient {
    evaluations: Mutex<Vec<Evaluation>>,
    evaluate_calls: AtomicUsize,
}

impl StubFeatureClient {
    pub fn set_evaluations(&self, evaluations: Vec<Evaluation>) {
        *self.evaluations.lock() = evaluations;
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeatureClient for StubFeatureClient {
    async fn list_features(&self, _env: &str) -> Result<Vec<Feature>, ClientError> {
        Ok(vec![])
    }

    async fn list_segment_users(
        &self,
        _env: &str,
        _segment_id: &str,
    ) -> Result<SegmentUsers, ClientError> {
        Err(ClientError::NotFound)
    }

    async fn evaluate_features(
        &self,
        _env: &str,
        _user: &User,
        _tag: &str,
    ) -> Result<UserEvaluations, ClientError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UserEvaluations {
            id: "live".into(),
            evaluations: self.evaluations.lock().clone(),
        })
    }
}
