//! Two-phase shutdown for transport clients.
//!
//! 1. A closing [`Context`] is cancelled so no new consume or publish starts
//!    and the reconnect supervisor exits instead of retrying.
//! 2. The [`InFlight`] group is drained: it is entered before and left after
//!    every handler invocation, so no handler is abandoned mid-flight. Running
//!    `consume` calls are then awaited so their final commits land before the
//!    native client is closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::context::Context;
use crate::error::{MqError, Result};

/// Wait group counting running handler invocations.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one handler invocation; it ends when the guard is dropped.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            group: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no invocation is running.
    pub async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a concurrent last exit is not missed
            drained.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// RAII registration in an [`InFlight`] group.
#[derive(Debug)]
pub struct InFlightGuard {
    group: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.group.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.drained.notify_waiters();
        }
    }
}

/// Closing signal plus in-flight group owned by every transport client.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    closing: Context,
    in_flight: Arc<InFlight>,
    consumers: Arc<InFlight>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            closing: Context::background(),
            in_flight: Arc::new(InFlight::new()),
            consumers: Arc::new(InFlight::new()),
        }
    }

    /// The closing signal, cancelled by stop and graceful stop.
    pub fn closing(&self) -> &Context {
        &self.closing
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Running `consume` calls.
    pub fn consumers(&self) -> &Arc<InFlight> {
        &self.consumers
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Fail fast once the client has been stopped.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            Err(MqError::Closed)
        } else {
            Ok(())
        }
    }

    /// Phase one: flip the closing signal.
    pub fn signal_close(&self) {
        self.closing.cancel();
    }

    /// Phase one then phase two.
    pub async fn close_gracefully(&self) {
        self.signal_close();
        let pending = self.in_flight.count();
        if pending > 0 {
            tracing::info!(in_flight = pending, "Waiting for in-flight handlers to finish");
        }
        self.in_flight.wait().await;
        self.consumers.wait().await;
    }

    /// Graceful close bounded by `limit`; returns whether the group drained.
    pub async fn close_within(&self, limit: Duration) -> bool {
        match timeout(limit, self.close_gracefully()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    remaining = self.in_flight.count(),
                    "In-flight handlers did not finish before the drain timeout"
                );
                false
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let group = Arc::new(InFlight::new());
        timeout(Duration::from_millis(100), group.wait())
            .await
            .expect("idle group should not block");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_guards_drop() {
        let group = Arc::new(InFlight::new());
        let first = group.enter();
        let second = group.enter();
        assert_eq!(group.count(), 2);

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait().await })
        };

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_rejects_after_close() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.ensure_open().is_ok());

        lifecycle.close_gracefully().await;

        assert!(matches!(lifecycle.ensure_open(), Err(MqError::Closed)));
    }

    #[tokio::test]
    async fn test_close_waits_for_consumers_after_handlers() {
        let lifecycle = Lifecycle::new();
        let consumer = lifecycle.consumers().enter();

        let closer = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.close_gracefully().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lifecycle.is_closing());
        assert!(!closer.is_finished());

        drop(consumer);
        timeout(Duration::from_secs(1), closer)
            .await
            .expect("close should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_within_reports_stuck_handlers() {
        let lifecycle = Lifecycle::new();
        let _guard = lifecycle.in_flight().enter();

        assert!(!lifecycle.close_within(Duration::from_millis(20)).await);
        assert!(lifecycle.is_closing());
    }
}
