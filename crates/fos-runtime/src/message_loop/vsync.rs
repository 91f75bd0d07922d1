//! VSync Alignment
//!
//! Per-loop bookkeeping for wakeups routed through a vertical-sync source:
//! the outstanding request, the budget of the last frame and whether a frame
//! arrived that still has to be flushed on the loop thread.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use fos_base::{TimeDelta, TimePoint};
use parking_lot::{Mutex, RwLock};

use crate::vsync_monitor::VSyncMonitor;

/// Share of a frame given to VSync-aligned queues
pub const TRAVERSAL_PROPORTION: f64 = 0.5;

/// A VSync request older than this no longer holds back timer wakeups
pub const WAITING_VSYNC_TIMEOUT: TimeDelta = TimeDelta::from_milliseconds(100);

/// Budgets derived from one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
    /// Whole frame, `target - start` truncated to milliseconds
    pub frame: TimeDelta,
    /// Share of the frame for VSync-aligned queues
    pub aligned: TimeDelta,
}

impl FrameBudget {
    pub fn from_frame(frame_start_ns: i64, frame_target_ns: i64) -> Self {
        let span = frame_target_ns.saturating_sub(frame_start_ns).max(0);
        Self {
            frame: TimeDelta::from_milliseconds(span / 1_000_000),
            aligned: TimeDelta::from_milliseconds((span as f64 * TRAVERSAL_PROPORTION / 1e6) as i64),
        }
    }
}

pub(crate) struct VSyncState {
    monitor: RwLock<Option<Arc<dyn VSyncMonitor>>>,
    /// Every plain wakeup of the loop goes through VSync
    whole_loop: bool,
    requested_at: Mutex<Option<TimePoint>>,
    aligned_budget_nanos: AtomicI64,
    frame_ready: AtomicBool,
}

impl VSyncState {
    pub(crate) fn disabled() -> Self {
        Self::build(None, false)
    }

    pub(crate) fn whole_loop(monitor: Arc<dyn VSyncMonitor>) -> Self {
        Self::build(Some(monitor), true)
    }

    fn build(monitor: Option<Arc<dyn VSyncMonitor>>, whole_loop: bool) -> Self {
        Self {
            monitor: RwLock::new(monitor),
            whole_loop,
            requested_at: Mutex::new(None),
            aligned_budget_nanos: AtomicI64::new(i64::MAX),
            frame_ready: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_monitor(&self, monitor: Option<Arc<dyn VSyncMonitor>>) {
        *self.monitor.write() = monitor;
    }

    pub(crate) fn has_monitor(&self) -> bool {
        self.monitor.read().is_some()
    }

    pub(crate) fn is_whole_loop(&self) -> bool {
        self.whole_loop && self.has_monitor()
    }

    pub(crate) fn has_pending_request(&self) -> bool {
        self.requested_at.lock().is_some()
    }

    /// True if a request has gone unanswered for `WAITING_VSYNC_TIMEOUT`
    pub(crate) fn waited_too_long(&self, now: TimePoint) -> bool {
        self.requested_at
            .lock()
            .is_some_and(|requested_at| now - requested_at >= WAITING_VSYNC_TIMEOUT)
    }

    /// Claim the right to request a frame; `None` while one is outstanding
    pub(crate) fn begin_request(&self, now: TimePoint) -> Option<Arc<dyn VSyncMonitor>> {
        let monitor = self.monitor.read().clone()?;
        let mut requested_at = self.requested_at.lock();
        if requested_at.is_some() {
            return None;
        }
        *requested_at = Some(now);
        Some(monitor)
    }

    /// Forget an unanswered request so the next wakeup sends a new one
    pub(crate) fn cancel_request(&self) {
        *self.requested_at.lock() = None;
    }

    /// Record a delivered frame and return its budgets
    pub(crate) fn on_frame(&self, frame_start_ns: i64, frame_target_ns: i64) -> FrameBudget {
        *self.requested_at.lock() = None;
        let budget = FrameBudget::from_frame(frame_start_ns, frame_target_ns);
        self.aligned_budget_nanos
            .store(budget.aligned.to_nanoseconds(), Ordering::Release);
        budget
    }

    pub(crate) fn aligned_budget(&self) -> TimeDelta {
        TimeDelta::from_nanoseconds(self.aligned_budget_nanos.load(Ordering::Acquire))
    }

    pub(crate) fn mark_frame_ready(&self) {
        self.frame_ready.store(true, Ordering::Release);
    }

    pub(crate) fn take_frame_ready(&self) -> bool {
        self.frame_ready.swap(false, Ordering::AcqRel)
    }
}
