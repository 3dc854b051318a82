//! The event persister: a pull-based, back-pressured batching pipeline from
//! the bus to the warehouse sink.

use crate::datastore::{DatastoreWriter, RowStore};
use crate::metrics_defs::{FLUSH_SIZE, HANDLED, RECEIVED};
use crate::puller::RateLimitedPuller;
use crate::record;
use feature::client::FeatureClient;
use feature::storage::UserEvaluationsStorage;
use parking_lot::Mutex;
use shared::event::{Event, EventPayload};
use shared::pubsub::{PulledMessage, Puller};
use shared::shutdown::{ShutdownHandle, ShutdownSignal};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct PersisterOptions {
    pub max_mps: u32,
    pub num_workers: usize,
    pub flush_size: usize,
    pub flush_interval: Duration,
    pub flush_timeout: Duration,
}

impl Default for PersisterOptions {
    fn default() -> Self {
        Self {
            max_mps: 1000,
            num_workers: 1,
            flush_size: 50,
            flush_interval: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(20),
        }
    }
}

/// Collaborators shared by every worker.
struct Pipeline {
    feature_client: Arc<dyn FeatureClient>,
    datastore: Arc<dyn DatastoreWriter>,
    row_store: Option<Arc<dyn RowStore>>,
    user_evaluations_storage: Arc<dyn UserEvaluationsStorage>,
    options: PersisterOptions,
}

pub struct Persister {
    pipeline: Arc<Pipeline>,
    puller: Arc<dyn Puller>,
    shutdown: ShutdownSignal,
    finished_workers: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Persister {
    pub fn new(
        feature_client: Arc<dyn FeatureClient>,
        puller: Arc<dyn Puller>,
        datastore: Arc<dyn DatastoreWriter>,
        user_evaluations_storage: Arc<dyn UserEvaluationsStorage>,
        row_store: Option<Arc<dyn RowStore>>,
        options: PersisterOptions,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                feature_client,
                datastore,
                row_store,
                user_evaluations_storage,
                options,
            }),
            puller,
            shutdown: ShutdownSignal::new(),
            finished_workers: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the rate-limited puller and the batching workers.
    pub fn start(&self) {
        let rate_limited =
            RateLimitedPuller::new(self.puller.clone(), self.pipeline.options.max_mps);
        let (rx, puller_task) = rate_limited.start(self.shutdown.handle());
        let rx = Arc::new(AsyncMutex::new(rx));

        let mut tasks = vec![puller_task];
        for _ in 0..self.pipeline.options.num_workers.max(1) {
            let pipeline = self.pipeline.clone();
            let rx = rx.clone();
            let shutdown = self.shutdown.handle();
            let finished = self.finished_workers.clone();
            tasks.push(tokio::spawn(async move {
                pipeline.worker_loop(rx, shutdown).await;
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }
        *self.tasks.lock() = tasks;
    }

    /// Healthy while the root signal is live and no worker has exited.
    pub fn check(&self) -> HealthStatus {
        if self.shutdown.handle().is_cancelled() {
            tracing::error!("Unhealthy: persister has been stopped");
            return HealthStatus::Unhealthy;
        }
        let finished = self.finished_workers.load(Ordering::SeqCst);
        if finished > 0 {
            tracing::error!(finished, "Unhealthy: worker exited");
            return HealthStatus::Unhealthy;
        }
        HealthStatus::Healthy
    }

    /// Signals shutdown and blocks until the puller and every worker have
    /// exited. Workers flush their residual batch on the way out.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Pipeline {
    async fn recv(rx: &AsyncMutex<mpsc::Receiver<PulledMessage>>) -> Option<PulledMessage> {
        rx.lock().await.recv().await
    }

    async fn worker_loop(
        &self,
        rx: Arc<AsyncMutex<mpsc::Receiver<PulledMessage>>>,
        shutdown: ShutdownHandle,
    ) {
        let mut batch: HashMap<String, PulledMessage> = HashMap::new();
        let timer = tokio::time::sleep(self.options.flush_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                maybe = Self::recv(&rx) => match maybe {
                    Some(message) => {
                        metrics::counter!(RECEIVED.name).increment(1);
                        let id = message
                            .attributes
                            .get("id")
                            .cloned()
                            .unwrap_or_default();
                        if id.is_empty() {
                            message.ack();
                            metrics::counter!(HANDLED.name, "code" => "missing_id").increment(1);
                            continue;
                        }
                        if let Some(previous) = batch.insert(id.clone(), message) {
                            // Release the bus credit held by the earlier copy.
                            previous.ack();
                            tracing::warn!(%id, "Message with duplicate id");
                            metrics::counter!(HANDLED.name, "code" => "duplicate_id").increment(1);
                        }
                        if batch.len() < self.options.flush_size {
                            continue;
                        }
                        self.send(std::mem::take(&mut batch)).await;
                        timer
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.options.flush_interval);
                    }
                    None => break,
                },
                _ = &mut timer => {
                    if !batch.is_empty() {
                        self.send(std::mem::take(&mut batch)).await;
                    }
                    timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.options.flush_interval);
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // Best-effort drain so neither shutdown nor a closed subscription
        // strands a batch.
        if !batch.is_empty() {
            self.send(batch).await;
        }
    }

    async fn send(&self, messages: HashMap<String, PulledMessage>) {
        metrics::histogram!(FLUSH_SIZE.name).record(messages.len() as f64);

        let (fails, dropped) =
            match tokio::time::timeout(self.options.flush_timeout, self.flush(&messages)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(
                        len = messages.len(),
                        "Flush timed out; messages will be redelivered"
                    );
                    // Nothing reached the sink: let the bus redeliver.
                    for message in messages.values() {
                        message.nack();
                        metrics::counter!(HANDLED.name, "code" => "repeatable_error").increment(1);
                    }
                    return;
                }
            };

        for (id, message) in &messages {
            if dropped.contains(id) {
                continue;
            }
            match fails.get(id) {
                Some(true) => {
                    message.nack();
                    metrics::counter!(HANDLED.name, "code" => "repeatable_error").increment(1);
                }
                Some(false) => {
                    message.ack();
                    metrics::counter!(HANDLED.name, "code" => "non_repeatable_error").increment(1);
                }
                None => {
                    message.ack();
                    metrics::counter!(HANDLED.name, "code" => "ok").increment(1);
                }
            }
        }
    }

    /// Decodes, groups by environment, materializes, and writes. Returns the
    /// per-id failure map and the ids already settled during decoding.
    async fn flush(
        &self,
        messages: &HashMap<String, PulledMessage>,
    ) -> (HashMap<String, bool>, HashSet<String>) {
        let mut dropped = HashSet::new();
        let mut env_events: HashMap<String, Vec<(String, EventPayload)>> = HashMap::new();
        for (id, message) in messages {
            match Event::decode(&message.data) {
                Ok(event) => {
                    env_events
                        .entry(event.environment_namespace)
                        .or_default()
                        .push((id.clone(), event.payload));
                }
                Err(err) => {
                    tracing::error!(%id, error = %err, "bad message");
                    message.ack();
                    metrics::counter!(HANDLED.name, "code" => "bad_message").increment(1);
                    dropped.insert(id.clone());
                }
            }
        }
        if env_events.is_empty() {
            tracing::error!("all messages were bad");
            return (HashMap::new(), dropped);
        }

        let mut fails: HashMap<String, bool> = HashMap::new();
        for (environment_namespace, events) in env_events {
            let mut records: HashMap<String, serde_json::Value> = HashMap::new();
            for (id, payload) in events {
                match self
                    .materialize(&id, &payload, &environment_namespace)
                    .await
                {
                    Ok(record) => {
                        records.insert(id, record);
                    }
                    Err(repeatable) => {
                        fails.insert(id, repeatable);
                    }
                }
            }
            if records.is_empty() {
                continue;
            }
            match self.datastore.write(&environment_namespace, records).await {
                Ok(write_fails) => fails.extend(write_fails),
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        %environment_namespace,
                        "could not write to datastore"
                    );
                }
            }
        }
        (fails, dropped)
    }

    /// Produces the warehouse record for one event, feeding the row store
    /// on the side. Returns the repeatable flag on failure.
    async fn materialize(
        &self,
        id: &str,
        payload: &EventPayload,
        environment_namespace: &str,
    ) -> Result<serde_json::Value, bool> {
        match payload {
            EventPayload::Evaluation(event) => {
                self.write_row(id, environment_namespace, |row_store| {
                    let event = event.clone();
                    let id = id.to_string();
                    let env = environment_namespace.to_string();
                    async move { row_store.create_evaluation_event(&event, &id, &env).await }
                })
                .await;
                Ok(record::marshal_evaluation_event(event, environment_namespace))
            }
            EventPayload::User(event) => {
                self.write_row(id, environment_namespace, |row_store| {
                    let event = event.clone();
                    let id = id.to_string();
                    let env = environment_namespace.to_string();
                    async move { row_store.create_user_event(&event, &id, &env).await }
                })
                .await;
                Ok(record::marshal_user_event(event, environment_namespace))
            }
            EventPayload::Goal(event) => {
                let evaluations = record::goal_evaluations(
                    event,
                    environment_namespace,
                    self.user_evaluations_storage.as_ref(),
                    self.feature_client.as_ref(),
                )
                .await
                .map_err(|err| {
                    if !err.retriable {
                        tracing::error!(
                            id,
                            environment_namespace,
                            error = %err.message,
                            "failed to marshal an unrepeatable event"
                        );
                    }
                    err.retriable
                })?;
                let formatted: Vec<String> =
                    evaluations.iter().map(record::format_evaluation).collect();
                self.write_row(id, environment_namespace, |row_store| {
                    let event = event.clone();
                    let id = id.to_string();
                    let env = environment_namespace.to_string();
                    let formatted = formatted.clone();
                    async move {
                        row_store
                            .create_goal_event(&event, &id, &env, &formatted)
                            .await
                    }
                })
                .await;
                Ok(record::marshal_goal_event(
                    event,
                    environment_namespace,
                    &evaluations,
                ))
            }
            // Metrics and goal-batch envelopes belong to other consumers;
            // here they are poison.
            EventPayload::Metrics(_) | EventPayload::GoalBatch(_) => {
                tracing::error!(
                    id,
                    environment_namespace,
                    kind = payload.kind(),
                    "unexpected message type"
                );
                Err(false)
            }
        }
    }

    /// Row-store errors are logged and swallowed; the warehouse path alone
    /// decides acking.
    async fn write_row<F, Fut>(&self, id: &str, environment_namespace: &str, write: F)
    where
        F: FnOnce(Arc<dyn RowStore>) -> Fut,
        Fut: Future<Output = Result<(), crate::datastore::WriteError>>,
    {
        if let Some(row_store) = &self.row_store {
            if let Err(err) = write(row_store.clone()).await {
                tracing::error!(
                    error = %err,
                    id,
                    environment_namespace,
                    "failed to store an event"
                );
            }
        }
    }
}
