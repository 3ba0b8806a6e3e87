//! Session lifecycle state

use std::fmt;
use tokio::sync::watch;

use crate::error::FailureKind;

/// Session lifecycle state.
///
/// Transitions: `Connecting -> Connected -> Closed` on the clean path,
/// `Connecting -> Failed` / `Connected -> Failed` on the abnormal one.
/// `Failed` and `Closed` are absorbing; a session never leaves them. A gate
/// that wants a live session again creates a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport handshake in progress
    Connecting,
    /// Session is live; channels may be opened
    Connected,
    /// Session failed with a normalized failure kind
    Failed(FailureKind),
    /// Session was closed cleanly
    Closed,
}

impl SessionState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Closed)
    }

    /// The failure kind, if this is a failed state
    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            SessionState::Failed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed(kind) => write!(f, "failed ({})", kind),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Publishes session state transitions and enforces the state machine.
///
/// All session implementations route transitions through a `StateCell` so
/// the terminal-state invariant holds regardless of transport callback
/// ordering: once `Failed` or `Closed` is published, later transition
/// attempts are dropped. Observers subscribe via [`StateCell::subscribe`]
/// and see a monotonic sequence.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    /// Create a cell starting in `Connecting`
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self { tx }
    }

    /// Current state
    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Attempt a transition. Returns `false` if the transition was refused
    /// (current state is terminal, or the transition repeats the current
    /// state).
    pub fn set(&self, next: SessionState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                tracing::debug!("Ignoring state transition {} -> {}", current, next);
                return false;
            }
            *current = next;
            changed = true;
            true
        });
        changed
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_path() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Connecting);
        assert!(cell.set(SessionState::Connected));
        assert!(cell.set(SessionState::Closed));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_terminal_states_absorb() {
        let cell = StateCell::new();
        assert!(cell.set(SessionState::Failed(FailureKind::Unreachable)));

        // No transition out of failed, not even to closed
        assert!(!cell.set(SessionState::Connected));
        assert!(!cell.set(SessionState::Closed));
        assert_eq!(
            cell.get(),
            SessionState::Failed(FailureKind::Unreachable)
        );
    }

    #[test]
    fn test_no_duplicate_connected() {
        let cell = StateCell::new();
        assert!(cell.set(SessionState::Connected));
        assert!(!cell.set(SessionState::Connected));
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();

        cell.set(SessionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Connected);

        cell.set(SessionState::Failed(FailureKind::Disconnected));
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_terminal());
    }
}
