//! Handoff of a single value from a completion callback to a parked worker.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

enum Slot<T> {
    Waiting,
    Ready(T),
    Abandoned,
}

/// A one-shot slot that a worker can wait on with a timeout.
///
/// Whoever loses the race between [Latch::set] and a timed-out [Latch::wait] gets the
/// value back, so it is never silently dropped.
pub(crate) struct Latch<T> {
    slot: Mutex<Slot<T>>,
    cv: Condvar,
}

impl<T> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Waiting),
            cv: Condvar::new(),
        }
    }

    /// Deliver `value`, returning it if the waiter already gave up.
    pub(crate) fn set(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.lock().unwrap();
        match *slot {
            Slot::Waiting => {
                *slot = Slot::Ready(value);
                self.cv.notify_one();
                Ok(())
            }
            Slot::Ready(_) | Slot::Abandoned => Err(value),
        }
    }

    /// Wait up to `timeout` for a value. On timeout the latch is abandoned and any later
    /// [Latch::set] is rejected.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<T> {
        let slot = self.slot.lock().unwrap();
        let (mut slot, _) = self
            .cv
            .wait_timeout_while(slot, timeout, |slot| matches!(slot, Slot::Waiting))
            .unwrap();
        match std::mem::replace(&mut *slot, Slot::Abandoned) {
            Slot::Ready(value) => Some(value),
            Slot::Waiting | Slot::Abandoned => None,
        }
    }
}
