//! In-flight connection accounting.
//!
//! Every accepted connection holds a [`ConnectionGuard`]; the counter drops
//! when the guard does, so a connection can never be released twice and the
//! count never goes below zero.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

/// Shared in-flight counter for one listener.
#[derive(Debug, Clone, Default)]
pub struct DrainTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// Marks one live connection. Decrements the tracker on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl DrainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection.
    pub fn guard(&self) -> ConnectionGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no connection is in flight.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a guard dropped in between is not missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for idle, giving up after `timeout`.
    ///
    /// Returns `true` if every connection finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.active();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_ms = timeout.as_millis() as u64,
            "Draining active connections"
        );

        if tokio::time::timeout(timeout, self.wait()).await.is_ok() {
            info!("All connections drained cleanly");
            true
        } else {
            warn!(
                remaining_connections = self.active(),
                timeout_ms = timeout.as_millis() as u64,
                "Drain timeout expired"
            );
            false
        }
    }
}
