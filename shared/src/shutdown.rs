//! Cooperative cancellation.
//!
//! A [`ShutdownSignal`] is owned by whoever decides to stop (the service
//! runner, or the HTTP layer on behalf of a request); workers observe it
//! through cloned [`ShutdownHandle`]s.

use tokio::sync::watch;

pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    inner: HandleInner,
}

#[derive(Clone)]
enum HandleInner {
    Armed(watch::Receiver<bool>),
    Never,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            inner: HandleInner::Armed(self.tx.subscribe()),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    /// A handle that never fires. For callers with no cancellation source.
    pub fn never() -> Self {
        Self {
            inner: HandleInner::Never,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            HandleInner::Armed(rx) => *rx.borrow(),
            HandleInner::Never => false,
        }
    }

    /// Resolves once the owning signal fires. Pending forever for
    /// [`ShutdownHandle::never`] handles.
    pub async fn cancelled(&self) {
        match &self.inner {
            HandleInner::Armed(rx) => {
                let mut rx = rx.clone();
                // wait_for returns Err only if the sender is gone, which we
                // treat the same as a shutdown.
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            HandleInner::Never => std::future::pending().await,
        }
    }
}
