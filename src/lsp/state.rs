//! Connection run-state machine.

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tracing::debug;

use crate::error::ConnectionError;
use crate::event::{Emitter, Subscription};

use super::LspResult;

/// Run-state of a language server connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// Process spawned, initialize handshake in progress.
    Starting,
    /// Handshake complete, ready for requests.
    Running,
    /// Failed, exited or stopped. Terminal.
    Stopped,
}

impl ConnectionState {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Stopped) | (Self::Running, Self::Stopped)
        )
    }
}

/// A state change observed on a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StateChange {
    /// State before the transition.
    pub old: ConnectionState,
    /// State after the transition.
    pub new: ConnectionState,
}

/// Holds the current state and publishes every transition.
///
/// Synchronous observers registered through [`StateMachine::on_change`] run
/// before `transition` returns; async code can wait on [`StateMachine::watch`].
pub struct StateMachine {
    current: Mutex<ConnectionState>,
    // Held from the check through notification, so observers on other
    // threads see transitions in the order they were applied. Reentrant
    // for observers that transition themselves.
    order: ReentrantMutex<()>,
    tx: watch::Sender<ConnectionState>,
    changes: Emitter<StateChange>,
}

impl StateMachine {
    /// Creates a machine in the [`ConnectionState::Starting`] state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Starting);
        Self {
            current: Mutex::new(ConnectionState::Starting),
            order: ReentrantMutex::new(()),
            tx,
            changes: Emitter::new(),
        }
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::InvalidTransition`] for a forbidden move.
    pub fn transition(&self, next: ConnectionState) -> LspResult<()> {
        let _order = self.order.lock();
        let old = {
            let mut current = self.current.lock();
            let old = *current;
            if !old.can_transition_to(next) {
                return Err(ConnectionError::InvalidTransition { from: old, to: next });
            }
            *current = next;
            old
        };
        debug!(from = ?old, to = ?next, "connection state changed");
        self.tx.send_replace(next);
        self.changes.emit(&StateChange { old, new: next });
        Ok(())
    }

    /// Moves to Stopped unless already there. Returns whether a transition
    /// happened.
    pub fn stop(&self) -> bool {
        self.transition(ConnectionState::Stopped).is_ok()
    }

    /// Registers a synchronous observer of transitions.
    pub fn on_change(&self, listener: impl Fn(&StateChange) + Send + Sync + 'static) -> Subscription {
        self.changes.subscribe(listener)
    }

    /// A receiver that sees the latest state.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allowed_transitions() {
        use ConnectionState::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn test_stopped_is_terminal() {
        let machine = StateMachine::new();
        machine.transition(ConnectionState::Running).unwrap();
        assert!(machine.stop());
        assert!(!machine.stop());
        assert!(matches!(
            machine.transition(ConnectionState::Running),
            Err(ConnectionError::InvalidTransition { .. })
        ));
        assert_eq!(machine.get(), ConnectionState::Stopped);
    }

    #[test]
    fn test_observers_see_every_change() {
        let machine = StateMachine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = machine.on_change(move |change| seen_clone.lock().push(*change));

        machine.transition(ConnectionState::Running).unwrap();
        machine.stop();

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                StateChange {
                    old: ConnectionState::Starting,
                    new: ConnectionState::Running
                },
                StateChange {
                    old: ConnectionState::Running,
                    new: ConnectionState::Stopped
                },
            ]
        );
    }

    #[test]
    fn test_concurrent_transitions_notify_in_order() {
        let machine = Arc::new(StateMachine::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = machine.on_change(move |change| {
            if change.new == ConnectionState::Running {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            seen_clone.lock().push(change.new);
        });

        let starter = {
            let machine = machine.clone();
            std::thread::spawn(move || machine.transition(ConnectionState::Running))
        };
        while machine.get() != ConnectionState::Running {
            std::thread::yield_now();
        }
        assert!(machine.stop());
        starter.join().unwrap().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Running, ConnectionState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_watch_receives_latest() {
        let machine = StateMachine::new();
        let mut rx = machine.watch();
        machine.transition(ConnectionState::Running).unwrap();
        let state = rx
            .wait_for(|s| *s == ConnectionState::Running)
            .await
            .map(|s| *s)
            .unwrap();
        assert_eq!(state, ConnectionState::Running);
    }
}
