//! Task Identity
//!
//! Queue ids, priority grades and the immutable delayed-task descriptor.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use fos_base::TimePoint;

/// Task function type
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide sequence counter.
///
/// Wraparound would need 2^64 tasks in one polling period and is not handled.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Opaque id of a task queue in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskQueueId(u64);

impl TaskQueueId {
    /// Marks a queue that is not subsumed by any owner
    pub const UNMERGED: TaskQueueId = TaskQueueId(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_unmerged(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for TaskQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unmerged() {
            write!(f, "TaskQueueId(unmerged)")
        } else {
            write!(f, "TaskQueueId({})", self.0)
        }
    }
}

/// Priority class of a task.
///
/// `Microtask` < `Emergency` < `UserInteraction` = `Unspecified` < `Idle`,
/// where smaller runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskSourceGrade {
    /// JS-style microtask queue, drained before anything else
    Microtask,
    /// Shutdown, bind and unbind work
    Emergency,
    /// Input-driven work
    UserInteraction,
    /// Default grade for posted work
    #[default]
    Unspecified,
    /// Runs only when no primary task is due within the idle period
    Idle,
}

impl TaskSourceGrade {
    /// Rank used for priority comparisons; equal ranks share a heap
    pub const fn priority_class(self) -> u8 {
        match self {
            Self::Microtask => 0,
            Self::Emergency => 1,
            Self::UserInteraction | Self::Unspecified => 2,
            Self::Idle => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Microtask => "microtask",
            Self::Emergency => "emergency",
            Self::UserInteraction => "user-interaction",
            Self::Unspecified => "unspecified",
            Self::Idle => "idle",
        }
    }

    /// True if `self` is dispatched strictly before `other` when both are eligible
    pub const fn runs_before(self, other: TaskSourceGrade) -> bool {
        self.priority_class() < other.priority_class()
    }
}

/// A task waiting in a task source.
///
/// Ordered by target time, then by sequence number, ascending.
pub struct DelayedTask {
    order: u64,
    task: TaskFn,
    target_time: TimePoint,
    grade: TaskSourceGrade,
}

impl DelayedTask {
    pub fn new(order: u64, task: TaskFn, target_time: TimePoint, grade: TaskSourceGrade) -> Self {
        Self {
            order,
            task,
            target_time,
            grade,
        }
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn target_time(&self) -> TimePoint {
        self.target_time
    }

    pub fn grade(&self) -> TaskSourceGrade {
        self.grade
    }

    /// Move the callable out; the descriptor is consumed
    pub fn into_task(self) -> TaskFn {
        self.task
    }
}

impl fmt::Debug for DelayedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedTask")
            .field("order", &self.order)
            .field("target_time", &self.target_time)
            .field("grade", &self.grade)
            .finish()
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.target_time == other.target_time
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.target_time
            .cmp(&other.target_time)
            .then_with(|| self.order.cmp(&other.order))
    }
}

/// Snapshot of the next eligible task in a source, without its callable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopTask {
    pub task_queue_id: TaskQueueId,
    pub order: u64,
    pub target_time: TimePoint,
    pub grade: TaskSourceGrade,
}

impl TopTask {
    /// Global `(target_time, order)` comparison used across merged queues
    pub fn is_before(&self, other: &TopTask) -> bool {
        (self.target_time, self.order) < (other.target_time, other.order)
    }
}

/// A popped task ready to run
pub struct TopTaskResult {
    pub task_queue_id: TaskQueueId,
    pub task: TaskFn,
}

impl fmt::Debug for TopTaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopTaskResult")
            .field("task_queue_id", &self.task_queue_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fos_base::TimeDelta;

    fn noop() -> TaskFn {
        Box::new(|| {})
    }

    #[test]
    fn test_grade_priority_order() {
        assert!(TaskSourceGrade::Microtask.runs_before(TaskSourceGrade::Emergency));
        assert!(TaskSourceGrade::Emergency.runs_before(TaskSourceGrade::UserInteraction));
        assert!(!TaskSourceGrade::UserInteraction.runs_before(TaskSourceGrade::Unspecified));
        assert!(!TaskSourceGrade::Unspecified.runs_before(TaskSourceGrade::UserInteraction));
        assert!(TaskSourceGrade::Unspecified.runs_before(TaskSourceGrade::Idle));
    }

    #[test]
    fn test_delayed_task_ordering() {
        let now = TimePoint::now();
        let early = DelayedTask::new(5, noop(), now, TaskSourceGrade::Unspecified);
        let late = DelayedTask::new(1, noop(), now + TimeDelta::from_milliseconds(1), TaskSourceGrade::Unspecified);
        let tie = DelayedTask::new(6, noop(), now, TaskSourceGrade::Unspecified);
        assert!(early < late);
        assert!(early < tie);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let a = next_sequence();
        let b = next_sequence();
        assert!(b > a);
    }

    #[test]
    fn test_unmerged_sentinel() {
        assert!(TaskQueueId::UNMERGED.is_unmerged());
        assert!(!TaskQueueId::new(0).is_unmerged());
    }
}
