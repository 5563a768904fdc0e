//! Connection lifecycle.
//!
//! A connection moves through a small set of states as completions arrive:
//!
//! ```text
//! Unknown -> Disconnected -> Connected <-> FlushingWriteQueue
//!                                |              |
//!                                v              v
//!                     FlushingWriteQueueBeforeDisconnect -> Disconnecting -> Stopped
//! ```
//!
//! Every state except [State::Stopped] may also move directly to [State::Stopped]
//! (an explicit stop or a failed completion). [State::Stopped] is terminal, so a stop
//! always takes precedence over a flush or disconnect racing with it on another worker.

use thiserror::Error;

/// State of a connection handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Unknown,
    /// Waiting for an accept to complete.
    Disconnected,
    /// A receive is armed (or a round is in progress).
    Connected,
    /// Draining the write queue, then reading again.
    FlushingWriteQueue,
    /// Draining the write queue, then disconnecting.
    FlushingWriteQueueBeforeDisconnect,
    /// A disconnect is in flight.
    Disconnecting,
    /// Terminal.
    Stopped,
}

impl State {
    /// Returns true if the lifecycle may move from `self` to `next`.
    pub fn can_transition(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Unknown, Disconnected)
                | (Disconnected, Connected)
                | (Connected, FlushingWriteQueue)
                | (Connected, FlushingWriteQueueBeforeDisconnect)
                | (FlushingWriteQueue, Connected)
                | (FlushingWriteQueue, FlushingWriteQueueBeforeDisconnect)
                | (FlushingWriteQueueBeforeDisconnect, Disconnecting)
        ) || (self != Stopped && next == Stopped)
    }

    /// Returns true if the connection is draining its write queue.
    pub fn is_flushing(self) -> bool {
        matches!(
            self,
            State::FlushingWriteQueue | State::FlushingWriteQueueBeforeDisconnect
        )
    }
}

/// Attempted to move between two states that are not connected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition: {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: State,
    pub to: State,
}

/// Owner of a [State] that only changes through [Machine::transition].
#[derive(Debug)]
pub struct Machine {
    state: State,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// Create a machine for a handler that has not yet accepted a connection.
    pub fn new() -> Self {
        Self {
            state: State::Disconnected,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: State) -> Result<State, IllegalTransition> {
        let from = self.state;
        if !from.can_transition(next) {
            return Err(IllegalTransition { from, to: next });
        }
        self.state = next;
        Ok(from)
    }

    /// Move to [State::Stopped], returning false if already stopped.
    pub fn stop(&mut self) -> bool {
        self.transition(State::Stopped).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.state == State::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 7] = [
        State::Unknown,
        State::Disconnected,
        State::Connected,
        State::FlushingWriteQueue,
        State::FlushingWriteQueueBeforeDisconnect,
        State::Disconnecting,
        State::Stopped,
    ];

    #[test]
    fn test_normal_lifecycle() {
        let mut machine = Machine::new();
        assert_eq!(machine.state(), State::Disconnected);
        machine.transition(State::Connected).unwrap();
        machine.transition(State::FlushingWriteQueue).unwrap();
        machine.transition(State::Connected).unwrap();
        machine
            .transition(State::FlushingWriteQueueBeforeDisconnect)
            .unwrap();
        machine.transition(State::Disconnecting).unwrap();
        assert_eq!(machine.transition(State::Stopped), Ok(State::Disconnecting));
        assert!(machine.is_stopped());
    }

    #[test]
    fn test_stopped_is_terminal() {
        for next in ALL {
            let mut machine = Machine::new();
            assert!(machine.stop());
            assert_eq!(
                machine.transition(next),
                Err(IllegalTransition {
                    from: State::Stopped,
                    to: next
                })
            );
            assert!(!machine.stop());
        }
    }

    #[test]
    fn test_any_live_state_can_stop() {
        for from in ALL.into_iter().filter(|s| *s != State::Stopped) {
            assert!(from.can_transition(State::Stopped), "{from:?}");
        }
    }

    #[test]
    fn test_illegal_transitions() {
        let mut machine = Machine::new();
        assert!(machine.transition(State::Disconnecting).is_err());
        assert!(machine.transition(State::FlushingWriteQueue).is_err());
        machine.transition(State::Connected).unwrap();
        assert!(machine.transition(State::Disconnected).is_err());
        assert!(machine.transition(State::Disconnecting).is_err());
        machine
            .transition(State::FlushingWriteQueueBeforeDisconnect)
            .unwrap();
        assert!(machine.transition(State::Connected).is_err());
        assert_eq!(machine.state(), State::FlushingWriteQueueBeforeDisconnect);
    }
}
