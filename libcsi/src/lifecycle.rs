//! Server lifecycle status and state machine.
//!
//! ```text
//! Initializing → MountingVolumes → Serving → ShuttingDown → Stopped
//! ```
//!
//! Reload passes run inside `Serving` and never change the state.  The
//! current state is published through a [`watch`] channel so the Identity
//! service can answer `Probe` without locking.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::CsiError;

/// Lifecycle status of the plugin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Process started, nothing done yet.
    Initializing,
    /// Startup reconciliation pass in progress.
    MountingVolumes,
    /// Endpoint bound and accepting RPCs.
    Serving,
    /// Interrupt received; no new work accepted, in-flight calls draining.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl ServerState {
    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, target),
            (Initializing, MountingVolumes)
                | (MountingVolumes, Serving)
                | (Serving, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, ServerState::Serving)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Stopped)
    }
}

/// Shared handle on the server state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::Initializing);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ServerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting transitions the state machine does not
    /// allow.
    pub fn transition(&self, next: ServerState) -> Result<(), CsiError> {
        let mut rejected = None;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = ?*current, to = ?next, "lifecycle transition");
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });
        match rejected {
            Some(from) => Err(CsiError::InvalidTransition { from, to: next }),
            None => Ok(()),
        }
    }

    /// Wait until the state equals `target`.
    pub async fn wait_for(&self, target: ServerState) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerState::*;

    #[test]
    fn valid_transitions() {
        assert!(Initializing.can_transition_to(MountingVolumes));
        assert!(MountingVolumes.can_transition_to(Serving));
        assert!(Serving.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Stopped));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!Initializing.can_transition_to(Serving));
        assert!(!MountingVolumes.can_transition_to(ShuttingDown));
        assert!(!Serving.can_transition_to(Serving));
        assert!(!Serving.can_transition_to(MountingVolumes));
        assert!(!Stopped.can_transition_to(Initializing));
    }

    #[test]
    fn lifecycle_walks_the_happy_path() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), Initializing);
        for next in [MountingVolumes, Serving, ShuttingDown, Stopped] {
            lifecycle.transition(next).unwrap();
            assert_eq!(lifecycle.state(), next);
        }
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn rejected_transition_keeps_state() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle.transition(Serving).unwrap_err();
        assert!(matches!(
            err,
            CsiError::InvalidTransition {
                from: Initializing,
                to: Serving
            }
        ));
        assert_eq!(lifecycle.state(), Initializing);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_for(Serving).await })
        };
        lifecycle.transition(MountingVolumes).unwrap();
        lifecycle.transition(Serving).unwrap();
        waiter.await.unwrap();
        assert!(lifecycle.subscribe().borrow().is_serving());
    }
}
