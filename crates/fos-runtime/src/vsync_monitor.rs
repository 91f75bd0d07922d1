//! VSync Monitors
//!
//! Sources of vertical-sync callbacks. The host display link is external, so
//! the runtime only needs `request_vsync`: each request is answered by at most
//! one callback carrying `(frame_start_ns, frame_target_ns)` on the monitor's
//! thread of choice.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use fos_base::{Env, EnvKey, TimeDelta, TimePoint};
use parking_lot::{Condvar, Mutex};

use crate::task_runner::TaskRunner;

/// Frame callback: `(frame_start_ns, frame_target_ns)`
pub type VSyncCallback = Box<dyn FnOnce(i64, i64) + Send + 'static>;

/// Refresh interval of a 60 Hz display
pub const DEFAULT_FRAME_INTERVAL: TimeDelta = TimeDelta::from_microseconds(16_667);

/// Provider of vertical-sync callbacks
pub trait VSyncMonitor: Send + Sync {
    /// Ask for one callback at the next frame boundary
    fn request_vsync(&self, callback: VSyncCallback);
}

/// Nanosecond timestamp on the runtime clock
pub fn frame_timestamp(time_point: TimePoint) -> i64 {
    time_point.to_epoch_delta().to_nanoseconds()
}

/// Monitor whose frames are delivered by the caller.
///
/// The host (or a test) calls [`ManualVSyncMonitor::fire`] when a frame begins.
#[derive(Default)]
pub struct ManualVSyncMonitor {
    pending: Mutex<Vec<VSyncCallback>>,
}

impl ManualVSyncMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks waiting for the next frame
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Deliver one frame to every pending request; returns how many fired
    pub fn fire(&self, frame_start_ns: i64, frame_target_ns: i64) -> usize {
        let callbacks = std::mem::take(&mut *self.pending.lock());
        let fired = callbacks.len();
        for callback in callbacks {
            callback(frame_start_ns, frame_target_ns);
        }
        fired
    }

    /// Deliver a frame starting now and lasting `interval`
    pub fn fire_frame(&self, interval: TimeDelta) -> usize {
        let start = TimePoint::now();
        self.fire(frame_timestamp(start), frame_timestamp(start + interval))
    }
}

impl VSyncMonitor for ManualVSyncMonitor {
    fn request_vsync(&self, callback: VSyncCallback) {
        self.pending.lock().push(callback);
    }
}

impl std::fmt::Debug for ManualVSyncMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualVSyncMonitor")
            .field("pending", &self.pending_requests())
            .finish()
    }
}

struct TickerState {
    pending: Vec<VSyncCallback>,
    shutdown: bool,
}

struct Ticker {
    state: Mutex<TickerState>,
    condvar: Condvar,
    interval: TimeDelta,
}

impl Ticker {
    fn run(&self) {
        let mut next_frame = TimePoint::now() + self.interval;
        loop {
            let callbacks = {
                let mut state = self.state.lock();
                while state.pending.is_empty() && !state.shutdown {
                    self.condvar.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                // Align to the next frame boundary after the request
                let now = TimePoint::now();
                while next_frame < now {
                    next_frame = next_frame + self.interval;
                }
                while TimePoint::now() < next_frame && !state.shutdown {
                    let timeout = next_frame.saturating_duration_since_now();
                    self.condvar.wait_for(&mut state, timeout);
                }
                if state.shutdown {
                    return;
                }
                std::mem::take(&mut state.pending)
            };
            let frame_start = next_frame;
            next_frame = next_frame + self.interval;
            for callback in callbacks {
                callback(frame_timestamp(frame_start), frame_timestamp(frame_start + self.interval));
            }
        }
    }
}

/// Fixed-refresh display link running on its own thread.
///
/// Ticks only while requests are pending.
pub struct TimerVSyncMonitor {
    ticker: Arc<Ticker>,
    thread: Option<JoinHandle<()>>,
}

impl TimerVSyncMonitor {
    /// Monitor ticking every `interval`; non-positive intervals fall back to 60 Hz
    pub fn new(interval: TimeDelta) -> Self {
        let interval = if interval > TimeDelta::zero() {
            interval
        } else {
            DEFAULT_FRAME_INTERVAL
        };
        let ticker = Arc::new(Ticker {
            state: Mutex::new(TickerState {
                pending: Vec::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
            interval,
        });
        let thread = {
            let ticker = Arc::clone(&ticker);
            thread::Builder::new()
                .name("FosVSync".to_string())
                .spawn(move || ticker.run())
        };
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!("Failed to start VSync ticker, frames will not be delivered: {}", err);
                None
            }
        };
        Self { ticker, thread }
    }

    pub fn interval(&self) -> TimeDelta {
        self.ticker.interval
    }
}

impl Default for TimerVSyncMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

impl VSyncMonitor for TimerVSyncMonitor {
    fn request_vsync(&self, callback: VSyncCallback) {
        let mut state = self.ticker.state.lock();
        if state.shutdown {
            return;
        }
        state.pending.push(callback);
        self.ticker.condvar.notify_one();
    }
}

impl Drop for TimerVSyncMonitor {
    fn drop(&mut self) {
        let dropped = {
            let mut state = self.ticker.state.lock();
            state.shutdown = true;
            self.ticker.condvar.notify_all();
            std::mem::take(&mut state.pending)
        };
        drop(dropped);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for TimerVSyncMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerVSyncMonitor")
            .field("interval", &self.ticker.interval)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

/// Monitor that hops every callback onto a task runner.
///
/// Frames from `inner` are delivered as trampoline tasks, posted with
/// emergency grade when `IsVSyncPostTaskByEmergency` is set. The runner is
/// held weakly; frames arriving after it is gone are dropped.
pub struct PostingVSyncMonitor {
    inner: Arc<dyn VSyncMonitor>,
    runner: Weak<TaskRunner>,
    post_by_emergency: bool,
}

impl PostingVSyncMonitor {
    pub fn new(inner: Arc<dyn VSyncMonitor>, runner: Arc<TaskRunner>) -> Self {
        let post_by_emergency = Env::instance().get_bool(EnvKey::IsVSyncPostTaskByEmergency, false);
        Self::with_emergency(inner, runner, post_by_emergency)
    }

    pub fn with_emergency(inner: Arc<dyn VSyncMonitor>, runner: Arc<TaskRunner>, post_by_emergency: bool) -> Self {
        Self {
            inner,
            runner: Arc::downgrade(&runner),
            post_by_emergency,
        }
    }

    pub fn posts_by_emergency(&self) -> bool {
        self.post_by_emergency
    }
}

impl VSyncMonitor for PostingVSyncMonitor {
    fn request_vsync(&self, callback: VSyncCallback) {
        let runner = Weak::clone(&self.runner);
        let by_emergency = self.post_by_emergency;
        self.inner.request_vsync(Box::new(move |frame_start, frame_target| {
            let Some(runner) = runner.upgrade() else {
                return;
            };
            let trampoline = move || callback(frame_start, frame_target);
            if by_emergency {
                runner.post_emergency_task(trampoline);
            } else {
                runner.post_task(trampoline);
            }
        }));
    }
}
