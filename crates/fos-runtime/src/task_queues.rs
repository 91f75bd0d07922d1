//! Task Queue Registry
//!
//! Process-wide map from `TaskQueueId` to queue state. Tracks which wakeable
//! hosts each queue, merges (one owner subsuming other queues for a while),
//! task observers, and decides which task runs next across a set of queues.
//!
//! All state sits behind one mutex. Task closures and wakeup calls never run
//! while that mutex is held: drained tasks are dropped, and wakeups are
//! dispatched, after the guard is released.

use std::cell::Cell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use fos_base::TimePoint;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::MergeError;
use crate::task::{
    next_sequence, DelayedTask, TaskFn, TaskQueueId, TaskSourceGrade, TopTask, TopTaskResult,
};
use crate::task_source::TaskSource;
use crate::wakeable::{same_wakeable, Wakeable};

/// Callback run after every task of a queue
pub type TaskObserver = Arc<dyn Fn() + Send + Sync>;

/// Opaque observer key; observers run in key insertion order
pub type ObserverKey = usize;

thread_local! {
    static CURRENT_GRADE: Cell<TaskSourceGrade> = const { Cell::new(TaskSourceGrade::Unspecified) };
}

/// Per-queue state
struct TaskQueueEntry {
    wakeable: Option<Weak<dyn Wakeable>>,
    task_source: TaskSource,
    task_observers: IndexMap<ObserverKey, TaskObserver>,
    owner_of: BTreeSet<TaskQueueId>,
    subsumed_by: TaskQueueId,
    created_for: TaskQueueId,
    vsync_aligned: bool,
}

impl TaskQueueEntry {
    fn new(created_for: TaskQueueId) -> Self {
        Self {
            wakeable: None,
            task_source: TaskSource::new(created_for),
            task_observers: IndexMap::new(),
            owner_of: BTreeSet::new(),
            subsumed_by: TaskQueueId::UNMERGED,
            created_for,
            vsync_aligned: false,
        }
    }

    fn is_subsumed(&self) -> bool {
        !self.subsumed_by.is_unmerged()
    }
}

/// Wakeup to deliver once the registry lock is released
struct WakeRequest {
    wakeable: Arc<dyn Wakeable>,
    time_point: TimePoint,
    by_vsync: bool,
}

impl WakeRequest {
    fn dispatch(self) {
        if self.by_vsync {
            self.wakeable.wake_up_by_vsync(self.time_point);
        } else {
            self.wakeable.wake_up(self.time_point);
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<TaskQueueId, TaskQueueEntry>,
    next_id: u64,
}

impl Inner {
    /// Subsumed queues never report pending tasks; owners include their
    /// subsumed queues.
    fn has_pending_tasks(&self, queue_id: TaskQueueId) -> bool {
        let Some(entry) = self.entries.get(&queue_id) else {
            return false;
        };
        if entry.is_subsumed() {
            return false;
        }
        if !entry.task_source.is_empty() {
            return true;
        }
        entry.owner_of.iter().any(|subsumed| {
            self.entries
                .get(subsumed)
                .is_some_and(|entry| !entry.task_source.is_empty())
        })
    }

    fn any_pending_tasks(&self, queue_ids: &[TaskQueueId]) -> bool {
        queue_ids.iter().any(|id| self.has_pending_tasks(*id))
    }

    fn peek_next_task(&self, owner: TaskQueueId, now: TimePoint) -> Option<TopTask> {
        let entry = self.entries.get(&owner)?;
        let mut top = entry.task_source.top_at(now);
        for subsumed in &entry.owner_of {
            let Some(candidate) = self
                .entries
                .get(subsumed)
                .and_then(|entry| entry.task_source.top_at(now))
            else {
                continue;
            };
            if top.is_none_or(|current| candidate.is_before(&current)) {
                top = Some(candidate);
            }
        }
        top
    }

    fn peek_next_task_among(&self, queue_ids: &[TaskQueueId], now: TimePoint) -> Option<TopTask> {
        let mut top: Option<TopTask> = None;
        for queue_id in queue_ids {
            if !self.has_pending_tasks(*queue_id) {
                continue;
            }
            let Some(candidate) = self.peek_next_task(*queue_id, now) else {
                continue;
            };
            if top.is_none_or(|current| candidate.is_before(&current)) {
                top = Some(candidate);
            }
        }
        top
    }

    fn next_wake_time(&self, queue_ids: &[TaskQueueId], now: TimePoint) -> Option<TimePoint> {
        queue_ids
            .iter()
            .filter(|id| self.has_pending_tasks(**id))
            .filter_map(|id| self.peek_next_task(*id, now))
            .map(|top| top.target_time)
            .min()
    }

    fn wake_request(&self, queue_id: TaskQueueId, time_point: TimePoint) -> Option<WakeRequest> {
        let entry = self.entries.get(&queue_id)?;
        let wakeable = entry.wakeable.as_ref()?.upgrade()?;
        Some(WakeRequest {
            wakeable,
            time_point,
            by_vsync: entry.vsync_aligned,
        })
    }

    /// Wake the first queue at the next wake time, or at `max` if drained
    fn rearm(&self, queue_ids: &[TaskQueueId], now: TimePoint) -> Option<WakeRequest> {
        let first = *queue_ids.first()?;
        let time_point = self
            .next_wake_time(queue_ids, now)
            .unwrap_or(TimePoint::max());
        self.wake_request(first, time_point)
    }

    /// Wake `queue_id` only if it has pending work
    fn wake_if_pending(&self, queue_id: TaskQueueId, now: TimePoint) -> Option<WakeRequest> {
        if !self.has_pending_tasks(queue_id) {
            return None;
        }
        let time_point = self.next_wake_time(&[queue_id], now)?;
        self.wake_request(queue_id, time_point)
    }
}

/// Registry of every task queue in the process
pub struct TaskQueues {
    inner: Mutex<Inner>,
}

impl fmt::Debug for TaskQueues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskQueues")
            .field("queues", &inner.entries.len())
            .field("next_id", &inner.next_id)
            .finish()
    }
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueues {
    /// Create a standalone registry. Loops and runners normally share
    /// [`TaskQueues::instance`]; separate registries are for isolation in tests.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide registry
    pub fn instance() -> Arc<TaskQueues> {
        static INSTANCE: OnceLock<Arc<TaskQueues>> = OnceLock::new();
        Arc::clone(INSTANCE.get_or_init(|| Arc::new(TaskQueues::new())))
    }

    /// Grade of the task most recently handed out on this thread
    pub fn current_task_source_grade() -> TaskSourceGrade {
        CURRENT_GRADE.with(Cell::get)
    }

    pub fn create_task_queue(&self) -> TaskQueueId {
        let mut inner = self.inner.lock();
        let queue_id = TaskQueueId::new(inner.next_id);
        inner.next_id += 1;
        inner.entries.insert(queue_id, TaskQueueEntry::new(queue_id));
        tracing::trace!("Created task queue {}", queue_id);
        queue_id
    }

    /// Remove a queue and every queue it currently owns.
    ///
    /// # Panics
    ///
    /// Disposing a queue that is still subsumed is a programmer error.
    pub fn dispose(&self, queue_id: TaskQueueId) {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get(&queue_id) else {
                tracing::warn!("Dispose of unknown task queue {}", queue_id);
                return;
            };
            assert!(
                !entry.is_subsumed(),
                "Task queue {} disposed while subsumed by {}",
                queue_id,
                entry.subsumed_by
            );
            let owned: Vec<TaskQueueId> = entry.owner_of.iter().copied().collect();
            let mut removed = Vec::with_capacity(owned.len() + 1);
            for subsumed in owned {
                removed.extend(inner.entries.remove(&subsumed));
            }
            removed.extend(inner.entries.remove(&queue_id));
            removed
        };
        tracing::trace!("Disposed task queue {} ({} entries)", queue_id, removed.len());
        drop(removed);
    }

    /// Drop every pending task of a queue and the queues it owns, keeping the entries
    pub fn dispose_tasks(&self, queue_id: TaskQueueId) {
        let drained = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&queue_id) else {
                return;
            };
            let mut drained = entry.task_source.shut_down();
            let owned: Vec<TaskQueueId> = entry.owner_of.iter().copied().collect();
            for subsumed in owned {
                if let Some(entry) = inner.entries.get_mut(&subsumed) {
                    drained.extend(entry.task_source.shut_down());
                }
            }
            drained
        };
        drop(drained);
    }

    /// Insert a task and wake whichever loop serves the queue.
    ///
    /// An unknown queue hands the task back to the caller.
    pub fn register_task(
        &self,
        queue_id: TaskQueueId,
        task: TaskFn,
        target_time: TimePoint,
        grade: TaskSourceGrade,
    ) -> Result<(), TaskFn> {
        let wake = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(&queue_id) else {
                return Err(task);
            };
            entry
                .task_source
                .register_task(DelayedTask::new(next_sequence(), task, target_time, grade));
            let loop_to_wake = if entry.is_subsumed() {
                entry.subsumed_by
            } else {
                queue_id
            };
            inner.wake_if_pending(loop_to_wake, TimePoint::now())
        };
        if let Some(wake) = wake {
            wake.dispatch();
        }
        Ok(())
    }

    pub fn has_pending_tasks(&self, queue_id: TaskQueueId) -> bool {
        self.inner.lock().has_pending_tasks(queue_id)
    }

    /// Pending tasks visible through `queue_id`: zero for a subsumed queue,
    /// own plus subsumed tasks for an owner
    pub fn get_num_pending_tasks(&self, queue_id: TaskQueueId) -> usize {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&queue_id) else {
            return 0;
        };
        if entry.is_subsumed() {
            return 0;
        }
        let owned: usize = entry
            .owner_of
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|entry| entry.task_source.num_pending_tasks())
            .sum();
        entry.task_source.num_pending_tasks() + owned
    }

    /// Pop the next task across `queue_ids` if it is due at `from_time`.
    ///
    /// The first queue's wakeable is always re-armed, either at the next wake
    /// time or at `TimePoint::max()` once everything has drained.
    pub fn get_next_task_to_run(
        &self,
        queue_ids: &[TaskQueueId],
        from_time: TimePoint,
    ) -> Option<TopTaskResult> {
        let (wake, result) = {
            let mut inner = self.inner.lock();
            if !inner.any_pending_tasks(queue_ids) {
                return None;
            }
            let now = TimePoint::now();
            let top = inner.peek_next_task_among(queue_ids, now)?;
            let wake = inner.rearm(queue_ids, now);

            let result = if top.target_time > from_time {
                None
            } else {
                inner
                    .entries
                    .get_mut(&top.task_queue_id)
                    .and_then(|entry| entry.task_source.pop_task(top.grade))
                    .map(|task| {
                        CURRENT_GRADE.with(|grade| grade.set(top.grade));
                        TopTaskResult {
                            task_queue_id: top.task_queue_id,
                            task: task.into_task(),
                        }
                    })
            };
            (wake, result)
        };
        if let Some(wake) = wake {
            wake.dispatch();
        }
        result
    }

    /// Re-arm the first queue's wakeable for the given set
    pub fn wake_up(&self, queue_ids: &[TaskQueueId]) {
        let wake = {
            let inner = self.inner.lock();
            inner.rearm(queue_ids, TimePoint::now())
        };
        if let Some(wake) = wake {
            wake.dispatch();
        }
    }

    /// Wake the queue's loop if it has pending work
    pub fn wake_up_if_pending(&self, queue_id: TaskQueueId) {
        let wake = {
            let inner = self.inner.lock();
            inner.wake_if_pending(queue_id, TimePoint::now())
        };
        if let Some(wake) = wake {
            wake.dispatch();
        }
    }

    pub fn add_task_observer(&self, queue_id: TaskQueueId, key: ObserverKey, observer: TaskObserver) {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&queue_id) {
            Some(entry) => {
                entry.task_observers.insert(key, observer);
            }
            None => tracing::warn!("Observer {} added to unknown task queue {}", key, queue_id),
        }
    }

    pub fn remove_task_observer(&self, queue_id: TaskQueueId, key: ObserverKey) {
        let removed = {
            let mut inner = self.inner.lock();
            inner
                .entries
                .get_mut(&queue_id)
                .and_then(|entry| entry.task_observers.shift_remove(&key))
        };
        drop(removed);
    }

    /// Observers to run after a task of `queue_id`: its own, then those of
    /// every queue it owns. Empty for a subsumed queue, whose owner's
    /// observers fire instead.
    pub fn get_observers_to_notify(&self, queue_id: TaskQueueId) -> Vec<TaskObserver> {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&queue_id) else {
            return Vec::new();
        };
        if entry.is_subsumed() {
            return Vec::new();
        }
        let mut observers: Vec<TaskObserver> = entry.task_observers.values().cloned().collect();
        for subsumed in &entry.owner_of {
            if let Some(subsumed_entry) = inner.entries.get(subsumed) {
                observers.extend(subsumed_entry.task_observers.values().cloned());
            }
        }
        observers
    }

    /// Point a queue at the wakeable of the loop hosting it, or detach it
    pub fn set_wakeable(&self, queue_id: TaskQueueId, wakeable: Option<Weak<dyn Wakeable>>) {
        let previous = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&queue_id) {
                Some(entry) => std::mem::replace(&mut entry.wakeable, wakeable),
                None => {
                    tracing::warn!("Wakeable set on unknown task queue {}", queue_id);
                    None
                }
            }
        };
        drop(previous);
    }

    /// True if the queue, or its owner while merged, is hosted by `wakeable`
    pub fn is_task_queue_running_on_given_message_loop(
        &self,
        wakeable: &dyn Wakeable,
        queue_id: TaskQueueId,
    ) -> bool {
        let inner = self.inner.lock();
        let Some(entry) = inner.entries.get(&queue_id) else {
            return false;
        };
        let host = if entry.is_subsumed() {
            inner.entries.get(&entry.subsumed_by)
        } else {
            Some(entry)
        };
        host.and_then(|entry| entry.wakeable.as_ref())
            .is_some_and(|weak| same_wakeable(weak, wakeable))
    }

    /// Let `owner` serve `subsumed`'s tasks until unmerged.
    ///
    /// Merging a queue with itself, or an already-owned pair, succeeds.
    pub fn merge(&self, owner: TaskQueueId, subsumed: TaskQueueId) -> Result<(), MergeError> {
        if owner == subsumed {
            return Ok(());
        }
        let wake = {
            let mut inner = self.inner.lock();
            let owner_entry = inner.entries.get(&owner).ok_or(MergeError::UnknownQueue(owner))?;
            let subsumed_entry = inner
                .entries
                .get(&subsumed)
                .ok_or(MergeError::UnknownQueue(subsumed))?;
            if owner_entry.owner_of.contains(&subsumed) {
                return Ok(());
            }
            let rejection = if owner_entry.is_subsumed() {
                Some(MergeError::OwnerSubsumed {
                    owner,
                    by: owner_entry.subsumed_by,
                })
            } else if !subsumed_entry.owner_of.is_empty() {
                Some(MergeError::SubsumedOwnsOthers {
                    subsumed,
                    count: subsumed_entry.owner_of.len(),
                })
            } else if subsumed_entry.is_subsumed() {
                Some(MergeError::SubsumedAlreadyMerged {
                    subsumed,
                    by: subsumed_entry.subsumed_by,
                })
            } else {
                None
            };
            if let Some(error) = rejection {
                tracing::warn!("Thread merging failed: {}", error);
                return Err(error);
            }

            if let Some(entry) = inner.entries.get_mut(&owner) {
                entry.owner_of.insert(subsumed);
            }
            if let Some(entry) = inner.entries.get_mut(&subsumed) {
                entry.subsumed_by = owner;
            }
            tracing::debug!("Merged {} into {}", subsumed, owner);
            inner.wake_if_pending(owner, TimePoint::now())
        };
        if let Some(wake) = wake {
            wake.dispatch();
        }
        Ok(())
    }

    /// Undo a merge; both queues are woken if they have pending work
    pub fn unmerge(&self, owner: TaskQueueId, subsumed: TaskQueueId) -> Result<(), MergeError> {
        let wakes = {
            let mut inner = self.inner.lock();
            let owner_entry = inner.entries.get(&owner).ok_or(MergeError::UnknownQueue(owner))?;
            let subsumed_entry = inner
                .entries
                .get(&subsumed)
                .ok_or(MergeError::UnknownQueue(subsumed))?;
            let rejection = if owner_entry.owner_of.is_empty() {
                Some(MergeError::OwnerOwnsNothing { owner })
            } else if owner_entry.is_subsumed() {
                Some(MergeError::OwnerSubsumed {
                    owner,
                    by: owner_entry.subsumed_by,
                })
            } else if !subsumed_entry.is_subsumed() {
                Some(MergeError::SubsumedNotMerged { subsumed })
            } else if !owner_entry.owner_of.contains(&subsumed) {
                Some(MergeError::NotOwned { owner, subsumed })
            } else {
                None
            };
            if let Some(error) = rejection {
                tracing::warn!("Thread unmerging failed: {}", error);
                return Err(error);
            }

            if let Some(entry) = inner.entries.get_mut(&subsumed) {
                entry.subsumed_by = TaskQueueId::UNMERGED;
            }
            if let Some(entry) = inner.entries.get_mut(&owner) {
                entry.owner_of.remove(&subsumed);
            }
            tracing::debug!("Unmerged {} from {}", subsumed, owner);
            let now = TimePoint::now();
            [inner.wake_if_pending(owner, now), inner.wake_if_pending(subsumed, now)]
        };
        for wake in wakes.into_iter().flatten() {
            wake.dispatch();
        }
        Ok(())
    }

    pub fn owns(&self, owner: TaskQueueId, subsumed: TaskQueueId) -> bool {
        if owner.is_unmerged() || subsumed.is_unmerged() {
            return false;
        }
        self.inner
            .lock()
            .entries
            .get(&owner)
            .is_some_and(|entry| entry.owner_of.contains(&subsumed))
    }

    pub fn get_subsumed_task_queue_ids(&self, owner: TaskQueueId) -> BTreeSet<TaskQueueId> {
        self.inner
            .lock()
            .entries
            .get(&owner)
            .map(|entry| entry.owner_of.clone())
            .unwrap_or_default()
    }

    /// Owner of `queue_id`, or `TaskQueueId::UNMERGED`
    pub fn get_owner(&self, queue_id: TaskQueueId) -> TaskQueueId {
        self.inner
            .lock()
            .entries
            .get(&queue_id)
            .map_or(TaskQueueId::UNMERGED, |entry| entry.subsumed_by)
    }

    pub fn is_subsumed(&self, queue_id: TaskQueueId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&queue_id)
            .is_some_and(TaskQueueEntry::is_subsumed)
    }

    pub fn contains(&self, queue_id: TaskQueueId) -> bool {
        self.inner.lock().entries.contains_key(&queue_id)
    }

    /// Id the entry was created for
    pub fn created_for(&self, queue_id: TaskQueueId) -> Option<TaskQueueId> {
        self.inner
            .lock()
            .entries
            .get(&queue_id)
            .map(|entry| entry.created_for)
    }

    pub fn get_all_queue_ids(&self) -> Vec<TaskQueueId> {
        let mut ids: Vec<TaskQueueId> = self.inner.lock().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Flag a queue as flushed only on VSync by loops that support it
    pub fn set_task_queue_aligned_with_vsync(&self, queue_id: TaskQueueId, aligned: bool) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&queue_id) {
            entry.vsync_aligned = aligned;
        }
    }

    pub fn is_task_queue_aligned_with_vsync(&self, queue_id: TaskQueueId) -> bool {
        self.inner
            .lock()
            .entries
            .get(&queue_id)
            .is_some_and(|entry| entry.vsync_aligned)
    }
}
