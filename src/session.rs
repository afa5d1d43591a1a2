//! Cooperative worker control shared by the long-lived node sessions.
//!
//! A [`Worker`] couples a stop token with a pause signal. Sessions call
//! [`Worker::checkpoint`] once per loop iteration, before their next blocking
//! I/O call. Nothing here interrupts an I/O operation already in flight: a
//! stopped session notices at its next checkpoint, or when its channel is
//! closed underneath it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Stop/suspend handle for one session task.
#[derive(Debug, Clone)]
pub struct Worker {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel,
            paused: Arc::new(paused),
        }
    }

    /// Pause the session before its next blocking call.
    pub fn suspend(&self) {
        self.paused.send_replace(true);
    }

    /// Let a suspended session continue.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Ask the session to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_suspended(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait while suspended. Returns `false` once the worker has been stopped.
    pub async fn checkpoint(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let mut paused = self.paused.subscribe();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            resumed = paused.wait_for(|p| !*p) => {
                let resumed = resumed.is_ok();
                resumed && !self.cancel.is_cancelled()
            }
        }
    }

    /// Sleep for `period` unless stopped first. Returns `false` if stopped.
    pub(crate) async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(period) => true,
        }
    }
}
