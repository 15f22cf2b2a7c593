//! Cancellation scopes threaded through consume, publish and every message.
//!
//! A [`Context`] is cancelled explicitly, by reaching its deadline, or when any
//! of its ancestors is cancelled. Cancelling a child never affects the parent.

use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;

/// Why a context is no longer active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Cancelled,
    DeadlineExceeded,
}

/// Cancellable scope with an optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    /// Own scope last, ancestors before it
    scopes: Vec<Arc<watch::Sender<bool>>>,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is only cancelled explicitly.
    pub fn background() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            scopes: vec![Arc::new(tx)],
            deadline: None,
        }
    }

    /// A child scope cancelled together with `self`.
    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        let mut scopes = self.scopes.clone();
        scopes.push(Arc::new(tx));
        Self {
            scopes,
            deadline: self.deadline,
        }
    }

    /// A child scope that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let deadline = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    /// Cancel this scope and all of its children.
    pub fn cancel(&self) {
        if let Some(own) = self.scopes.last() {
            own.send_replace(true);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` while the context is active.
    pub fn err(&self) -> Option<ContextError> {
        if self.scopes.iter().any(|s| *s.borrow()) {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Completes once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let waits = self.scopes.iter().map(|scope| {
            let mut rx = scope.subscribe();
            Box::pin(async move {
                // The sender lives as long as `self`, so this only returns on cancel
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            })
        });
        let any_scope = select_all(waits);

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = any_scope => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => {
                any_scope.await;
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
