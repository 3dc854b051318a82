//! Publisher/puller seams over the message bus.
//!
//! The production bus driver is an external collaborator; services only see
//! these traits. [`InProcessTopic`] implements both ends in-process for
//! tests and the single-process standalone mode.

use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Publisher unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), PublishError>;

    /// Batched publish. Either the whole batch is accepted or the caller
    /// treats every event in it as unpublished.
    async fn publish_multi(&self, events: &[Event]) -> Result<(), PublishError>;
}

/// Acknowledgement sink for a pulled message. `positive` distinguishes ack
/// from nack; a nack asks the bus to redeliver.
pub trait Acker: Send + Sync {
    fn settle(&self, positive: bool);
}

/// A message pulled off the bus. Settling is idempotent; the first
/// `ack`/`nack` wins.
pub struct PulledMessage {
    pub id: String,
    pub attributes: HashMap<String, String>,
    pub data: Vec<u8>,
    acker: Arc<dyn Acker>,
    settled: AtomicBool,
}

impl PulledMessage {
    pub fn new(
        id: impl Into<String>,
        attributes: HashMap<String, String>,
        data: Vec<u8>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            id: id.into(),
            attributes,
            data,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub fn ack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.acker.settle(true);
        }
    }

    pub fn nack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.acker.settle(false);
        }
    }
}

#[async_trait]
pub trait Puller: Send + Sync {
    /// Next message from the subscription, or `None` once it is closed and
    /// drained.
    async fn pull(&self) -> Option<PulledMessage>;
}

struct QueuedMessage {
    id: String,
    attributes: HashMap<String, String>,
    data: Vec<u8>,
}

/// In-process topic: a bounded queue with at-least-once redelivery on nack.
pub struct InProcessTopic {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<QueuedMessage>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>,
}

impl InProcessTopic {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        })
    }

    /// Closes the publishing side; pending messages remain pullable.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    fn enqueue(&self, msg: QueuedMessage) -> Result<(), PublishError> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| PublishError::Unavailable("topic closed".into()))?;
        tx.send(msg)
            .map_err(|_| PublishError::Unavailable("topic closed".into()))
    }
}

#[async_trait]
impl Publisher for Arc<InProcessTopic> {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let mut attributes = HashMap::new();
        attributes.insert("id".to_string(), event.id.clone());
        self.enqueue(QueuedMessage {
            id: event.id.clone(),
            attributes,
            data: event.encode(),
        })
    }

    async fn publish_multi(&self, events: &[Event]) -> Result<(), PublishError> {
        for event in events {
            self.publish(event.clone()).await?;
        }
        Ok(())
    }
}

struct RedeliverAcker {
    topic: Arc<InProcessTopic>,
    id: String,
    attributes: HashMap<String, String>,
    data: Vec<u8>,
}

impl Acker for RedeliverAcker {
    fn settle(&self, positive: bool) {
        if !positive {
            let _ = self.topic.enqueue(QueuedMessage {
                id: self.id.clone(),
                attributes: self.attributes.clone(),
                data: self.data.clone(),
            });
        }
    }
}

#[async_trait]
impl Puller for Arc<InProcessTopic> {
    async fn pull(&self) -> Option<PulledMessage> {
        let msg = self.rx.lock().await.recv().await?;
        let acker = Arc::new(RedeliverAcker {
            topic: self.clone(),
            id: msg.id.clone(),
            attributes: msg.attributes.clone(),
            data: msg.data.clone(),
        });
        Some(PulledMessage::new(msg.id, msg.attributes, msg.data, acker))
    }
}
