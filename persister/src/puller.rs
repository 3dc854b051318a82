//! Rate-limited pulling.
//!
//! A token bucket fronts the bus subscription so the pipeline never takes
//! more than `max_mps` messages per second (with one second of burst
//! credits). Back-pressure composes naturally: when workers fall behind,
//! the bounded channel fills, the producer stalls, and the bus stops
//! receiving credits.

use shared::pubsub::{PulledMessage, Puller};
use shared::shutdown::ShutdownHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: u32) -> Self {
        let rate = f64::from(rate_per_sec.max(1));
        Self {
            capacity: rate,
            tokens: rate,
            rate,
            refilled_at: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.refilled_at = now;
    }

    async fn acquire(&mut self) {
        loop {
            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - self.tokens) / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

pub struct RateLimitedPuller {
    puller: Arc<dyn Puller>,
    max_mps: u32,
}

impl RateLimitedPuller {
    pub fn new(puller: Arc<dyn Puller>, max_mps: u32) -> Self {
        Self { puller, max_mps }
    }

    /// Starts the producer task. The returned channel closes when the
    /// subscription drains or the shutdown signal fires.
    pub fn start(
        self,
        shutdown: ShutdownHandle,
    ) -> (mpsc::Receiver<PulledMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.max_mps.max(1) as usize);
        let handle = tokio::spawn(async move {
            let mut bucket = TokenBucket::new(self.max_mps);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = bucket.acquire() => {}
                }
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = self.puller.pull() => message,
                };
                match message {
                    Some(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            // Dropping the sender closes the channel; workers drain what is
            // already buffered and exit.
        });
        (rx, handle)
    }
}
