//! Acknowledgment state shared by every handle onto one in-flight message.

use std::sync::Mutex;

use tokio::sync::watch;

/// Terminal decision for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Unresolved,
    Acked,
    Nacked,
}

impl AckState {
    pub fn is_terminal(self) -> bool {
        self != AckState::Unresolved
    }
}

/// Tri-state ack cell.
///
/// Transitions happen under one exclusive lock and are published on a watch
/// channel, so any number of tasks can wait for (or poll) the outcome.
#[derive(Debug)]
pub(crate) struct AckCell {
    state: Mutex<AckState>,
    signal: watch::Sender<AckState>,
}

impl AckCell {
    pub(crate) fn new() -> Self {
        let (signal, _) = watch::channel(AckState::Unresolved);
        Self {
            state: Mutex::new(AckState::Unresolved),
            signal,
        }
    }

    /// Move to `target` unless the opposite terminal state is already set.
    pub(crate) fn resolve(&self, target: AckState) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match *state {
            AckState::Unresolved => {
                *state = target;
                self.signal.send_replace(target);
                true
            }
            current => current == target,
        }
    }

    pub(crate) fn state(&self) -> AckState {
        *self.signal.borrow()
    }

    /// Wait until the state satisfies `pred`, returning the observed state.
    pub(crate) async fn wait_for(&self, pred: impl Fn(AckState) -> bool) -> AckState {
        let mut rx = self.signal.subscribe();
        let observed = match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            // The sender is owned by `self` and cannot be dropped while borrowed
            Err(_) => self.state(),
        };
        observed
    }
}
