//! Loop Backends
//!
//! The platform primitive that blocks a thread and calls back into its loop
//! when a wakeup is due.

use fos_base::TimePoint;
use parking_lot::{Condvar, Mutex};

/// Blocking run loop driven by timed wakeups
pub trait LoopBackend: Send + Sync {
    /// Block the current thread, calling `flush` whenever a wakeup fires,
    /// until [`LoopBackend::terminate`] is called
    fn run(&self, flush: &mut dyn FnMut());

    /// Make `run` return as soon as possible
    fn terminate(&self);

    /// Arrange a `flush` no later than `time_point`.
    ///
    /// Pending wakeups coalesce into the earliest requested time.
    fn wake_up(&self, time_point: TimePoint);
}

#[derive(Debug, Default)]
struct TimerState {
    wake_time: Option<TimePoint>,
    terminated: bool,
}

/// Portable backend: a condition variable with a single coalesced deadline
#[derive(Debug, Default)]
pub struct TimerBackend {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

impl TimerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Earliest wakeup not yet fired
    pub fn pending_wake_time(&self) -> Option<TimePoint> {
        self.state.lock().wake_time
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }
}

impl LoopBackend for TimerBackend {
    fn run(&self, flush: &mut dyn FnMut()) {
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.terminated {
                        return;
                    }
                    match state.wake_time {
                        None => {
                            self.condvar.wait(&mut state);
                        }
                        Some(time_point) if time_point <= TimePoint::now() => {
                            state.wake_time = None;
                            break;
                        }
                        Some(time_point) => {
                            let timeout = time_point.saturating_duration_since_now();
                            self.condvar.wait_for(&mut state, timeout);
                        }
                    }
                }
            }
            flush();
        }
    }

    fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        self.condvar.notify_all();
    }

    fn wake_up(&self, time_point: TimePoint) {
        if time_point.is_max() {
            return;
        }
        let mut state = self.state.lock();
        let earliest = match state.wake_time {
            Some(pending) if pending <= time_point => return,
            _ => time_point,
        };
        state.wake_time = Some(earliest);
        self.condvar.notify_all();
    }
}
