//! Manually-reset completion events.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot, manually-reset edge signal.
///
/// Starts unset and transitions to set at most once via [`Event::signal`].
/// The transition unblocks every current waiter; later waits return
/// immediately. There is no reset.
pub(crate) struct Event {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Event {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the event. Idempotent.
    pub(crate) fn signal(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cond.notify_all();
    }

    /// Non-blocking check of whether the event is set.
    pub(crate) fn has_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    /// Block until the event is set or `timeout` elapses. Returns whether
    /// the event is set.
    ///
    /// A spurious wakeup re-enters the wait with the remaining budget, so
    /// the result reflects the event state, never the whim of the scheduler.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(v) => v,
                None => return false,
            };
            let (guard, _) = self.cond.wait_timeout(fired, remaining).unwrap();
            fired = guard;
        }
        true
    }
}
