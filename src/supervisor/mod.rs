//! Reconnect supervisor.
//!
//! Consumption is an explicit state machine:
//!
//! ```text
//!            session ended / retryable failure
//!  Consuming ───────────────────────────────────▶ Reconnecting
//!      ▲                                              │
//!      └──────────────── backoff elapsed ─────────────┘
//!
//!  any state ── deliberate close / context cancelled / fatal failure ──▶ Stopped
//! ```
//!
//! [`transition`] is a pure function so the termination rules can be tested
//! without a transport. [`ReconnectSupervisor`] drives a [`Subscription`]
//! through those states.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::infrastructure::backoff::{BackoffConfig, Backoff};
use crate::message::Message;
use crate::metrics::ReconnectMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Consuming,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The native session closed underneath the adapter
    SessionEnded,
    /// Opening or running the session failed
    SessionFailed { retryable: bool },
    /// Stop or graceful stop was requested
    DeliberateClose,
    /// The caller's context was cancelled
    ContextCancelled,
    /// The reconnect delay passed
    BackoffElapsed,
}

/// Next state for `event` observed in `state`.
pub fn transition(state: SupervisorState, event: SupervisorEvent) -> SupervisorState {
    use SupervisorEvent::*;
    use SupervisorState::*;

    match (state, event) {
        (Stopped, _) => Stopped,
        (_, DeliberateClose) | (_, ContextCancelled) => Stopped,
        (_, SessionFailed { retryable: false }) => Stopped,
        (Consuming, SessionEnded) | (Consuming, SessionFailed { retryable: true }) => Reconnecting,
        (Reconnecting, BackoffElapsed) => Consuming,
        (current, _) => current,
    }
}

/// One consumption session of a transport adapter.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscribe natively and pump deliveries into `out` until the transport
    /// closes the session. Returns `Ok(())` for a clean native close.
    async fn run_session(
        &self,
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Result<()>;
}

/// Restarts a [`Subscription`] after transport-level closure.
pub struct ReconnectSupervisor {
    transport: &'static str,
    backoff: BackoffConfig,
    state: watch::Sender<SupervisorState>,
    sessions: AtomicU64,
}

impl ReconnectSupervisor {
    pub fn new(transport: &'static str, backoff: BackoffConfig) -> Self {
        let (state, _) = watch::channel(SupervisorState::Consuming);
        Self {
            transport,
            backoff,
            state,
            sessions: AtomicU64::new(0),
        }
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Number of sessions opened so far.
    pub fn sessions_started(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Run sessions until closing fires, `ctx` is cancelled, the consumer side
    /// of `out` goes away or a non-retryable error occurs.
    pub async fn run(
        &self,
        subscription: &dyn Subscription,
        ctx: &Context,
        closing: &Context,
        out: mpsc::Sender<Message>,
    ) -> Result<()> {
        let mut backoff = Backoff::with_config(self.backoff.clone());
        let mut fatal: Option<MqError> = None;
        let mut state = SupervisorState::Consuming;
        self.state.send_replace(state);

        loop {
            match state {
                SupervisorState::Consuming => {
                    self.sessions.fetch_add(1, Ordering::Relaxed);

                    let mut event = match subscription.run_session(ctx, closing, &out).await {
                        Ok(()) => {
                            backoff.reset();
                            SupervisorEvent::SessionEnded
                        }
                        Err(e) => {
                            let retryable = e.is_retryable();
                            tracing::warn!(
                                transport = self.transport,
                                error = %e,
                                retryable = retryable,
                                "Consumer session failed"
                            );
                            if !retryable {
                                fatal = Some(e);
                            }
                            SupervisorEvent::SessionFailed { retryable }
                        }
                    };

                    // Deliberate signals take precedence over whatever ended the session
                    if let Some(interrupt) = Self::interrupt(ctx, closing, &out) {
                        event = interrupt;
                    }

                    state = transition(state, event);
                    if state == SupervisorState::Reconnecting {
                        tracing::warn!(
                            transport = self.transport,
                            "Consumer session closed by transport, reconnecting"
                        );
                    }
                }
                SupervisorState::Reconnecting => {
                    let delay = backoff.next_delay();
                    let event = tokio::select! {
                        biased;
                        _ = closing.cancelled() => SupervisorEvent::DeliberateClose,
                        _ = ctx.cancelled() => SupervisorEvent::ContextCancelled,
                        _ = out.closed() => SupervisorEvent::ContextCancelled,
                        _ = tokio::time::sleep(delay) => SupervisorEvent::BackoffElapsed,
                    };

                    state = transition(state, event);
                    if state == SupervisorState::Consuming {
                        ReconnectMetrics::record_reconnect(self.transport);
                        tracing::info!(
                            transport = self.transport,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "Resubscribing"
                        );
                    }
                }
                SupervisorState::Stopped => {
                    self.state.send_replace(state);
                    tracing::info!(transport = self.transport, "Reconnect supervisor stopped");
                    return match fatal {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }

            self.state.send_replace(state);
        }
    }

    fn interrupt(
        ctx: &Context,
        closing: &Context,
        out: &mpsc::Sender<Message>,
    ) -> Option<SupervisorEvent> {
        if closing.is_cancelled() {
            Some(SupervisorEvent::DeliberateClose)
        } else if ctx.is_cancelled() || out.is_closed() {
            Some(SupervisorEvent::ContextCancelled)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use SupervisorEvent::*;
    use SupervisorState::*;

    #[test]
    fn test_transitions() {
        assert_eq!(transition(Consuming, SessionEnded), Reconnecting);
        assert_eq!(transition(Consuming, SessionFailed { retryable: true }), Reconnecting);
        assert_eq!(transition(Consuming, SessionFailed { retryable: false }), Stopped);
        assert_eq!(transition(Reconnecting, BackoffElapsed), Consuming);
        assert_eq!(transition(Reconnecting, DeliberateClose), Stopped);
        assert_eq!(transition(Consuming, ContextCancelled), Stopped);
        assert_eq!(transition(Stopped, BackoffElapsed), Stopped);
        assert_eq!(transition(Consuming, BackoffElapsed), Consuming);
    }

    /// Ends every session immediately, as if the broker kept dropping us.
    struct Flapping {
        opened: AtomicUsize,
        fail_with: Option<fn() -> MqError>,
    }

    #[async_trait]
    impl Subscription for Flapping {
        async fn run_session(
            &self,
            _ctx: &Context,
            _closing: &Context,
            _out: &mpsc::Sender<Message>,
        ) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_resubscribes_until_closing() {
        let supervisor = Arc::new(ReconnectSupervisor::new("test", BackoffConfig::fixed(5)));
        let sub = Arc::new(Flapping {
            opened: AtomicUsize::new(0),
            fail_with: None,
        });
        let ctx = Context::background();
        let closing = Context::background();
        let (tx, _rx) = mpsc::channel(1);

        let task = {
            let supervisor = supervisor.clone();
            let sub = sub.clone();
            let ctx = ctx.clone();
            let closing = closing.clone();
            tokio::spawn(async move { supervisor.run(sub.as_ref(), &ctx, &closing, tx).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        closing.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(sub.opened.load(Ordering::SeqCst) >= 2);
        assert_eq!(supervisor.state(), Stopped);

        let opened = sub.opened.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sub.opened.load(Ordering::SeqCst), opened);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_supervisor() {
        let supervisor = ReconnectSupervisor::new("test", BackoffConfig::fixed(5));
        let sub = Flapping {
            opened: AtomicUsize::new(0),
            fail_with: Some(|| MqError::invalid_config("unknown topic")),
        };
        let (tx, _rx) = mpsc::channel(1);

        let result = supervisor
            .run(&sub, &Context::background(), &Context::background(), tx)
            .await;

        assert!(matches!(result, Err(MqError::InvalidConfig(_))));
        assert_eq!(sub.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_cancel_during_backoff() {
        let supervisor = ReconnectSupervisor::new("test", BackoffConfig::fixed(60_000));
        let sub = Flapping {
            opened: AtomicUsize::new(0),
            fail_with: Some(|| MqError::transport("broker unreachable")),
        };
        let ctx = Context::background();
        let (tx, _rx) = mpsc::channel(1);

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.run(&sub, &ctx, &Context::background(), tx),
        )
        .await
        .expect("cancel must interrupt the backoff");

        assert!(result.is_ok());
        assert_eq!(sub.opened.load(Ordering::SeqCst), 1);
    }
}
