//! Thread Mergers
//!
//! [`SharedThreadMerger`] keeps one merge alive for as long as any caller
//! holds a lease on it. [`ThreadMerger`] merges a pair of runners for its own
//! lifetime and must be created and dropped on the owner's thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use fos_base::{AutoResetWaitableEvent, TimePoint};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{MergeError, RuntimeError};
use crate::task::{TaskQueueId, TaskSourceGrade};
use crate::task_queues::TaskQueues;
use crate::task_runner::{SignalOnDrop, TaskRunner};

/// Identifies one lease holder of a [`SharedThreadMerger`]
pub type MergerCallerId = u64;

type SharedMergers = Mutex<HashMap<(TaskQueueId, TaskQueueId), Weak<SharedThreadMerger>>>;

fn shared_mergers() -> &'static SharedMergers {
    static MERGERS: OnceLock<SharedMergers> = OnceLock::new();
    MERGERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Lease-counted merge of one owner/subsumed pair
pub struct SharedThreadMerger {
    task_queues: Arc<TaskQueues>,
    owner: TaskQueueId,
    subsumed: TaskQueueId,
    leases: Mutex<IndexMap<MergerCallerId, usize>>,
    enabled: AtomicBool,
}

impl SharedThreadMerger {
    pub fn new(task_queues: Arc<TaskQueues>, owner: TaskQueueId, subsumed: TaskQueueId) -> Self {
        Self {
            task_queues,
            owner,
            subsumed,
            leases: Mutex::new(IndexMap::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// The process-wide merger for the runners' queue pair, created on first use
    pub fn shared(owner: &TaskRunner, subsumed: &TaskRunner) -> Arc<Self> {
        let key = (owner.task_queue_id(), subsumed.task_queue_id());
        let mut mergers = shared_mergers().lock();
        if let Some(existing) = mergers.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        mergers.retain(|_, merger| merger.strong_count() > 0);
        let merger = Arc::new(Self::new(Arc::clone(owner.task_queues()), key.0, key.1));
        mergers.insert(key, Arc::downgrade(&merger));
        merger
    }

    pub fn owner(&self) -> TaskQueueId {
        self.owner
    }

    pub fn subsumed(&self) -> TaskQueueId {
        self.subsumed
    }

    /// Merge the pair if needed and record `caller`'s lease.
    ///
    /// Returns false when the merger is disabled or the registry refuses.
    pub fn merge_with_lease(&self, caller: MergerCallerId, lease_term: usize) -> bool {
        let mut leases = self.leases.lock();
        if !self.is_enabled_unsafe() {
            tracing::debug!("Merger {} <- {} disabled, ignoring lease of {}", self.owner, self.subsumed, caller);
            return false;
        }
        if !self.is_merged_unsafe() && self.task_queues.merge(self.owner, self.subsumed).is_err() {
            return false;
        }
        leases.insert(caller, lease_term);
        tracing::debug!("Caller {} leased merge {} <- {} for {}", caller, self.owner, self.subsumed, lease_term);
        true
    }

    pub fn extend_lease_to(&self, caller: MergerCallerId, lease_term: usize) {
        let mut leases = self.leases.lock();
        match leases.get_mut(&caller) {
            Some(lease) => *lease = lease_term,
            None => tracing::debug!("Caller {} holds no lease to extend", caller),
        }
    }

    /// Count down `caller`'s lease; true once it has run out
    pub fn decrement_lease(&self, caller: MergerCallerId) -> bool {
        let mut leases = self.leases.lock();
        let Some(lease) = leases.get_mut(&caller) else {
            return false;
        };
        *lease = lease.saturating_sub(1);
        *lease == 0
    }

    /// Drop `caller`'s lease, unmerging if it was the last one.
    ///
    /// Returns true if this call unmerged the pair.
    pub fn unmerge_now_if_last_one(&self, caller: MergerCallerId) -> bool {
        let mut leases = self.leases.lock();
        leases.shift_remove(&caller);
        if !leases.is_empty() || !self.is_merged_unsafe() {
            return false;
        }
        self.task_queues.unmerge(self.owner, self.subsumed).is_ok()
    }

    /// Callers still holding a lease
    pub fn lease_holders(&self) -> Vec<MergerCallerId> {
        self.leases.lock().keys().copied().collect()
    }

    /// Merge state without taking the lease lock
    pub fn is_merged_unsafe(&self) -> bool {
        self.task_queues.owns(self.owner, self.subsumed)
    }

    pub fn is_enabled_unsafe(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled_unsafe(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl fmt::Debug for SharedThreadMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedThreadMerger")
            .field("owner", &self.owner)
            .field("subsumed", &self.subsumed)
            .field("leases", &*self.leases.lock())
            .field("enabled", &self.is_enabled_unsafe())
            .finish()
    }
}

/// Merges the subsumed runner's queue into the owner's for its lifetime
pub struct ThreadMerger {
    task_queues: Arc<TaskQueues>,
    owner: TaskQueueId,
    subsumed: TaskQueueId,
    created_on: ThreadId,
    merged: bool,
}

impl ThreadMerger {
    /// Merge `subsumed` into `owner`, waiting until the subsumed thread has
    /// let go of its queue.
    ///
    /// # Panics
    ///
    /// Panics if not called on the thread running `owner`'s tasks.
    pub fn new(owner: &TaskRunner, subsumed: &TaskRunner) -> Result<Self, RuntimeError> {
        if !owner.runs_tasks_on_current_thread() {
            panic!("ThreadMerger must be created on the owner's thread");
        }
        let mut merger = Self {
            task_queues: Arc::clone(owner.task_queues()),
            owner: owner.task_queue_id(),
            subsumed: subsumed.task_queue_id(),
            created_on: thread::current().id(),
            merged: false,
        };
        if merger.owner == merger.subsumed || subsumed.runs_tasks_on_current_thread() {
            return Ok(merger);
        }

        match subsumed.get_loop().filter(|loop_impl| !loop_impl.is_terminated()) {
            Some(loop_impl) => {
                let event = Arc::new(AutoResetWaitableEvent::new());
                let outcome: Arc<Mutex<Option<Result<(), MergeError>>>> = Arc::new(Mutex::new(None));
                let signal = SignalOnDrop::new(Arc::clone(&event));
                let (task_queues, sink) = (Arc::clone(&merger.task_queues), Arc::clone(&outcome));
                let (owner_id, subsumed_id) = (merger.owner, merger.subsumed);
                loop_impl.post_task(
                    Box::new(move || {
                        *sink.lock() = Some(task_queues.merge(owner_id, subsumed_id));
                        drop(signal);
                    }),
                    TimePoint::now(),
                    TaskSourceGrade::Emergency,
                );
                event.wait();
                let result = outcome.lock().take();
                match result {
                    Some(result) => result?,
                    // The subsumed loop went away without serving the merge
                    None => merger.task_queues.merge(merger.owner, merger.subsumed)?,
                }
            }
            None => merger.task_queues.merge(merger.owner, merger.subsumed)?,
        }
        merger.merged = true;
        Ok(merger)
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }
}

impl Drop for ThreadMerger {
    fn drop(&mut self) {
        if !self.merged {
            return;
        }
        if thread::current().id() != self.created_on {
            panic!("ThreadMerger must be dropped on the thread that created it");
        }
        if let Err(err) = self.task_queues.unmerge(self.owner, self.subsumed) {
            tracing::warn!("ThreadMerger failed to unmerge {} from {}: {}", self.subsumed, self.owner, err);
        }
    }
}

impl fmt::Debug for ThreadMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadMerger")
            .field("owner", &self.owner)
            .field("subsumed", &self.subsumed)
            .field("merged", &self.merged)
            .finish()
    }
}
