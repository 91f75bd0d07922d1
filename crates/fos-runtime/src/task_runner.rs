//! Task Runner
//!
//! Producer-side handle onto one task queue. A runner owns its queue id and at
//! most one binding to a message loop; binding transitions are serialized on
//! the target loop through emergency tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use fos_base::{AutoResetWaitableEvent, TimeDelta, TimePoint};
use parking_lot::Mutex;

use crate::message_loop::{current_loop_impl, MessageLoopImpl};
use crate::task::{TaskFn, TaskQueueId, TaskSourceGrade};
use crate::task_queues::TaskQueues;

/// Wait on an unbind task before reporting a loop that is not flushing
const UNBIND_WARN_AFTER: TimeDelta = TimeDelta::from_seconds(1);

/// Runner flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Default,
    /// Queue is flushed on VSync by loops that have a monitor
    VSync,
}

/// Signals the event when dropped, whether or not the owning task ran
pub(crate) struct SignalOnDrop(Arc<AutoResetWaitableEvent>);

impl SignalOnDrop {
    pub(crate) fn new(event: Arc<AutoResetWaitableEvent>) -> Self {
        Self(event)
    }
}

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.signal();
    }
}

struct Binding {
    loop_impl: Option<Arc<MessageLoopImpl>>,
    /// Set once the binding is withdrawn so a late bind task does nothing
    unbound: Arc<AtomicBool>,
}

/// Releases a runner's queue wherever it is dropped
struct QueueReleaser {
    task_queues: Arc<TaskQueues>,
    queue_id: TaskQueueId,
    loop_impl: Option<Weak<MessageLoopImpl>>,
}

impl Drop for QueueReleaser {
    fn drop(&mut self) {
        if let Some(loop_impl) = self.loop_impl.as_ref().and_then(Weak::upgrade) {
            loop_impl.unbind(self.queue_id);
        }
        let owner = self.task_queues.get_owner(self.queue_id);
        if !owner.is_unmerged() {
            tracing::warn!("Task runner {} released while merged into {}", self.queue_id, owner);
            let _ = self.task_queues.unmerge(owner, self.queue_id);
        }
        for subsumed in self.task_queues.get_subsumed_task_queue_ids(self.queue_id) {
            let _ = self.task_queues.unmerge(self.queue_id, subsumed);
        }
        self.task_queues.dispose(self.queue_id);
    }
}

/// Handle for posting tasks onto a queue
pub struct TaskRunner {
    task_queues: Arc<TaskQueues>,
    queue_id: TaskQueueId,
    binding: Mutex<Binding>,
    kind: RunnerKind,
}

impl TaskRunner {
    /// Create a runner with a fresh queue, bound to `loop_impl` if given
    pub fn new(task_queues: Arc<TaskQueues>, loop_impl: Option<Arc<MessageLoopImpl>>) -> Arc<Self> {
        Self::build(task_queues, loop_impl, RunnerKind::Default)
    }

    /// Create a runner whose queue is VSync-aligned
    pub fn new_vsync(task_queues: Arc<TaskQueues>, loop_impl: Option<Arc<MessageLoopImpl>>) -> Arc<Self> {
        Self::build(task_queues, loop_impl, RunnerKind::VSync)
    }

    /// Runner bound to `loop_impl`, sharing its registry
    pub fn for_loop(loop_impl: &Arc<MessageLoopImpl>) -> Arc<Self> {
        Self::new(Arc::clone(loop_impl.task_queues()), Some(Arc::clone(loop_impl)))
    }

    fn build(task_queues: Arc<TaskQueues>, loop_impl: Option<Arc<MessageLoopImpl>>, kind: RunnerKind) -> Arc<Self> {
        let queue_id = task_queues.create_task_queue();
        if kind == RunnerKind::VSync {
            task_queues.set_task_queue_aligned_with_vsync(queue_id, true);
        }
        let runner = Arc::new(Self {
            task_queues,
            queue_id,
            binding: Mutex::new(Binding {
                loop_impl: None,
                unbound: Arc::new(AtomicBool::new(false)),
            }),
            kind,
        });
        if let Some(loop_impl) = loop_impl {
            runner.bind(loop_impl);
        }
        runner
    }

    pub fn task_queue_id(&self) -> TaskQueueId {
        self.queue_id
    }

    pub fn kind(&self) -> RunnerKind {
        self.kind
    }

    pub fn task_queues(&self) -> &Arc<TaskQueues> {
        &self.task_queues
    }

    /// Loop the runner is bound to, if any
    pub fn get_loop(&self) -> Option<Arc<MessageLoopImpl>> {
        self.binding.lock().loop_impl.clone()
    }

    /// True if the runner is bound to a loop that no longer runs tasks
    pub fn is_loop_terminated(&self) -> bool {
        self.get_loop().is_some_and(|loop_impl| loop_impl.is_terminated())
    }

    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now(), TaskSourceGrade::Unspecified);
    }

    pub fn post_emergency_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now(), TaskSourceGrade::Emergency);
    }

    pub fn post_micro_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now(), TaskSourceGrade::Microtask);
    }

    pub fn post_idle_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now(), TaskSourceGrade::Idle);
    }

    pub fn post_user_interaction_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now(), TaskSourceGrade::UserInteraction);
    }

    pub fn post_delayed_task<F>(&self, task: F, delay: TimeDelta)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), TimePoint::now() + delay, TaskSourceGrade::Unspecified);
    }

    pub fn post_task_for_time<F>(&self, task: F, target_time: TimePoint)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task_with(Box::new(task), target_time, TaskSourceGrade::Unspecified);
    }

    /// Post with an explicit target time and grade.
    ///
    /// Once the bound loop has terminated the task runs on the caller before
    /// this returns, whatever its target time.
    pub fn post_task_with(&self, task: TaskFn, target_time: TimePoint, grade: TaskSourceGrade) {
        if self.is_loop_terminated() {
            MessageLoopImpl::run_after_termination(task);
            return;
        }
        if let Err(task) = self
            .task_queues
            .register_task(self.queue_id, task, target_time, grade)
        {
            tracing::debug!("Dropping task posted to disposed queue {}", self.queue_id);
            drop(task);
        }
    }

    /// Run `task` on the runner's thread and wait for it to finish.
    ///
    /// Runs inline if the caller is already on that thread.
    pub fn post_sync_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.runs_tasks_on_current_thread() {
            task();
            return;
        }
        let event = Arc::new(AutoResetWaitableEvent::new());
        let signal = SignalOnDrop::new(Arc::clone(&event));
        self.post_task(move || {
            task();
            drop(signal);
        });
        event.wait();
    }

    /// True if the queue, or its owner while merged, is served by the loop
    /// running on this thread
    pub fn runs_tasks_on_current_thread(&self) -> bool {
        if self.kind == RunnerKind::VSync {
            let on_host = self
                .get_loop()
                .is_some_and(|loop_impl| loop_impl.host_thread() == std::thread::current().id());
            if on_host {
                return true;
            }
        }
        let Some(current) = current_loop_impl() else {
            return false;
        };
        self.task_queues
            .is_task_queue_running_on_given_message_loop(&*current, self.queue_id)
    }

    /// Move the queue onto `target`, unbinding from the current loop first
    pub fn bind(&self, target: Arc<MessageLoopImpl>) {
        self.unbind();
        let unbound = Arc::new(AtomicBool::new(false));
        {
            let mut binding = self.binding.lock();
            binding.loop_impl = Some(Arc::clone(&target));
            binding.unbound = Arc::clone(&unbound);
        }
        if target.can_run_now() {
            target.bind(self.queue_id);
            return;
        }
        let queue_id = self.queue_id;
        let weak = Arc::downgrade(&target);
        target.post_task(
            Box::new(move || {
                if unbound.load(Ordering::Acquire) {
                    return;
                }
                if let Some(loop_impl) = weak.upgrade() {
                    loop_impl.bind(queue_id);
                }
            }),
            TimePoint::now(),
            TaskSourceGrade::Emergency,
        );
    }

    /// Detach the queue from its loop. Blocks until the loop has let go of
    /// the queue when called from another thread.
    ///
    /// Off the loop thread the bound loop must be running (or later be run or
    /// terminated); a loop that is alive but never flushed blocks this call.
    pub fn unbind(&self) {
        let (loop_impl, unbound) = {
            let mut binding = self.binding.lock();
            (binding.loop_impl.take(), Arc::clone(&binding.unbound))
        };
        let Some(loop_impl) = loop_impl else {
            return;
        };
        unbound.store(true, Ordering::Release);
        if loop_impl.is_terminated() || loop_impl.can_run_now() {
            loop_impl.unbind(self.queue_id);
            return;
        }

        let event = Arc::new(AutoResetWaitableEvent::new());
        let signal = SignalOnDrop::new(Arc::clone(&event));
        let queue_id = self.queue_id;
        let weak = Arc::downgrade(&loop_impl);
        loop_impl.post_task(
            Box::new(move || {
                if let Some(loop_impl) = weak.upgrade() {
                    loop_impl.unbind(queue_id);
                }
                drop(signal);
            }),
            TimePoint::now(),
            TaskSourceGrade::Emergency,
        );
        if event.wait_with_timeout(UNBIND_WARN_AFTER) {
            tracing::warn!(
                "Unbinding {} still waits on its loop after {}; is the loop running?",
                queue_id,
                UNBIND_WARN_AFTER
            );
            event.wait();
        }
        // The loop may have terminated without serving the unbind task
        loop_impl.unbind(self.queue_id);
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        let binding = self.binding.get_mut();
        binding.unbound.store(true, Ordering::Release);
        let loop_impl = binding.loop_impl.take();
        let releaser = QueueReleaser {
            task_queues: Arc::clone(&self.task_queues),
            queue_id: self.queue_id,
            loop_impl: loop_impl.as_ref().map(Arc::downgrade),
        };
        match loop_impl {
            Some(loop_impl) if !loop_impl.is_terminated() && !loop_impl.can_run_now() => {
                loop_impl.post_task(
                    Box::new(move || drop(releaser)),
                    TimePoint::now(),
                    TaskSourceGrade::Emergency,
                );
            }
            _ => drop(releaser),
        }
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("queue_id", &self.queue_id)
            .field("kind", &self.kind)
            .field("bound", &self.get_loop().is_some())
            .finish()
    }
}
