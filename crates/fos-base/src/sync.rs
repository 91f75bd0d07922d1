//! Waitable Events
//!
//! Condition-variable backed events used to block a thread until another
//! thread signals it. The auto-reset flavour clears itself when a waiter
//! wakes; the manual-reset flavour stays signaled until `reset`.

use parking_lot::{Condvar, Mutex};

use crate::time::TimeDelta;

/// Event that resets itself once a single waiter has consumed the signal
#[derive(Debug, Default)]
pub struct AutoResetWaitableEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl AutoResetWaitableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking at most one waiter
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until signaled
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Block until signaled or the timeout passes.
    ///
    /// Returns `true` if the wait timed out.
    pub fn wait_with_timeout(&self, timeout: TimeDelta) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            let deadline = std::time::Instant::now() + timeout.to_duration();
            while !*signaled {
                if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                    break;
                }
            }
        }
        let timed_out = !*signaled;
        *signaled = false;
        timed_out
    }

    pub fn is_signaled_for_test(&self) -> bool {
        *self.signaled.lock()
    }
}

/// Event that stays signaled, releasing every waiter, until reset
#[derive(Debug, Default)]
pub struct ManualResetWaitableEvent {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl ManualResetWaitableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
    }

    /// Returns `true` if the wait timed out
    pub fn wait_with_timeout(&self, timeout: TimeDelta) -> bool {
        let deadline = std::time::Instant::now() + timeout.to_duration();
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                return !*signaled;
            }
        }
        false
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}
