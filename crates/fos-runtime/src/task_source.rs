//! Task Source
//!
//! Per-queue storage of delayed tasks split by grade. Microtask, emergency and
//! primary (user-interaction / unspecified) tasks live in min-heaps keyed by
//! `(target_time, order)`; idle tasks are kept in FIFO order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use fos_base::{TimeDelta, TimePoint};

use crate::task::{DelayedTask, TaskQueueId, TaskSourceGrade, TopTask};

/// Idle tasks wait while a primary task is due within this horizon
pub const IDLE_PERIOD: TimeDelta = TimeDelta::from_milliseconds(50);

type MinHeap = BinaryHeap<Reverse<DelayedTask>>;

/// Pending task counts by heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub microtask: usize,
    pub emergency: usize,
    pub primary: usize,
    pub idle: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.microtask + self.emergency + self.primary + self.idle
    }
}

/// Multi-heap task storage for one queue
#[derive(Debug)]
pub struct TaskSource {
    task_queue_id: TaskQueueId,
    microtask: MinHeap,
    emergency: MinHeap,
    primary: MinHeap,
    idle: VecDeque<DelayedTask>,
}

impl TaskSource {
    pub fn new(task_queue_id: TaskQueueId) -> Self {
        Self {
            task_queue_id,
            microtask: BinaryHeap::new(),
            emergency: BinaryHeap::new(),
            primary: BinaryHeap::new(),
            idle: VecDeque::new(),
        }
    }

    pub fn task_queue_id(&self) -> TaskQueueId {
        self.task_queue_id
    }

    pub fn register_task(&mut self, task: DelayedTask) {
        match task.grade() {
            TaskSourceGrade::Microtask => self.microtask.push(Reverse(task)),
            TaskSourceGrade::Emergency => self.emergency.push(Reverse(task)),
            TaskSourceGrade::UserInteraction | TaskSourceGrade::Unspecified => {
                self.primary.push(Reverse(task))
            }
            TaskSourceGrade::Idle => self.idle.push_back(task),
        }
    }

    /// Remove the head of the heap serving `grade`
    pub fn pop_task(&mut self, grade: TaskSourceGrade) -> Option<DelayedTask> {
        match grade {
            TaskSourceGrade::Microtask => self.microtask.pop().map(|Reverse(task)| task),
            TaskSourceGrade::Emergency => self.emergency.pop().map(|Reverse(task)| task),
            TaskSourceGrade::UserInteraction | TaskSourceGrade::Unspecified => {
                self.primary.pop().map(|Reverse(task)| task)
            }
            TaskSourceGrade::Idle => self.idle.pop_front(),
        }
    }

    /// Next eligible task across grades, judged against the current time
    pub fn top(&self) -> Option<TopTask> {
        self.top_at(TimePoint::now())
    }

    /// Next eligible task across grades.
    ///
    /// Microtasks first, then emergency, then primary unless an idle task is
    /// waiting and the primary head is more than one idle period away.
    pub fn top_at(&self, now: TimePoint) -> Option<TopTask> {
        if let Some(Reverse(task)) = self.microtask.peek() {
            return Some(self.describe(task));
        }
        if let Some(Reverse(task)) = self.emergency.peek() {
            return Some(self.describe(task));
        }
        if let Some(Reverse(task)) = self.primary.peek() {
            if self.idle.is_empty() || task.target_time() - now <= IDLE_PERIOD {
                return Some(self.describe(task));
            }
        }
        self.idle.front().map(|task| self.describe(task))
    }

    pub fn is_empty(&self) -> bool {
        self.num_pending_tasks() == 0
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.pending_counts().total()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            microtask: self.microtask.len(),
            emergency: self.emergency.len(),
            primary: self.primary.len(),
            idle: self.idle.len(),
        }
    }

    /// Remove every pending task.
    ///
    /// The tasks are handed back so the caller controls where they are dropped.
    #[must_use = "dropping the drained tasks runs their destructors"]
    pub fn shut_down(&mut self) -> Vec<DelayedTask> {
        let mut drained = Vec::with_capacity(self.num_pending_tasks());
        drained.extend(self.microtask.drain().map(|Reverse(task)| task));
        drained.extend(self.emergency.drain().map(|Reverse(task)| task));
        drained.extend(self.primary.drain().map(|Reverse(task)| task));
        drained.extend(self.idle.drain(..));
        drained
    }

    fn describe(&self, task: &DelayedTask) -> TopTask {
        TopTask {
            task_queue_id: self.task_queue_id,
            order: task.order(),
            target_time: task.target_time(),
            grade: task.grade(),
        }
    }
}
