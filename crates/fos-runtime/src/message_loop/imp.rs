//! Message Loop Implementation
//!
//! The per-thread engine behind [`super::MessageLoop`]. A loop owns an
//! internal queue, serves every queue bound to it, and flushes them whenever
//! its backend fires. Wakeups for VSync-aligned queues (or for every queue of
//! a VSync loop) are deferred to the next frame of the loop's monitor.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use fos_base::{TimeDelta, TimePoint};
use parking_lot::Mutex;

use super::backend::{LoopBackend, TimerBackend};
use super::vsync::{VSyncState, WAITING_VSYNC_TIMEOUT};
use super::FlushScope;
use crate::task::{TaskFn, TaskQueueId, TaskSourceGrade};
use crate::task_queues::{ObserverKey, TaskQueues};
use crate::vsync_monitor::VSyncMonitor;
use crate::wakeable::Wakeable;

/// How much work one flush may do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Every expired task, bounded by the restriction duration
    All,
    /// At most one task
    Single,
}

thread_local! {
    /// Posts made by a task that is itself running inline after termination
    static INLINE_PENDING: RefCell<Option<VecDeque<TaskFn>>> = const { RefCell::new(None) };
}

/// Outermost inline execution on this thread; drops leftovers on unwind
struct InlineScope;

impl InlineScope {
    fn next() -> Option<TaskFn> {
        INLINE_PENDING
            .try_with(|pending| pending.borrow_mut().as_mut().and_then(VecDeque::pop_front))
            .ok()
            .flatten()
    }
}

impl Drop for InlineScope {
    fn drop(&mut self) {
        let leftovers = INLINE_PENDING.try_with(|pending| pending.borrow_mut().take());
        drop(leftovers);
    }
}

/// Per-thread message loop engine
pub struct MessageLoopImpl {
    weak_self: Weak<MessageLoopImpl>,
    task_queues: Arc<TaskQueues>,
    internal_queue_id: TaskQueueId,
    queue_ids: Mutex<Vec<TaskQueueId>>,
    vsync_aligned_queue_ids: Mutex<Vec<TaskQueueId>>,
    terminated: AtomicBool,
    restriction_nanos: AtomicI64,
    flush_depth: AtomicUsize,
    host_thread: ThreadId,
    backend: Box<dyn LoopBackend>,
    vsync: VSyncState,
}

impl MessageLoopImpl {
    /// Loop with the portable timer backend
    pub fn new(task_queues: Arc<TaskQueues>) -> Arc<Self> {
        Self::with_backend(task_queues, Box::new(TimerBackend::new()))
    }

    /// Loop driven by a caller-provided backend
    pub fn with_backend(task_queues: Arc<TaskQueues>, backend: Box<dyn LoopBackend>) -> Arc<Self> {
        Self::build(task_queues, backend, VSyncState::disabled())
    }

    /// VSync loop: every wakeup that is already due waits for the next frame,
    /// and each frame sets the restriction duration to the frame budget.
    pub fn new_vsync(task_queues: Arc<TaskQueues>, monitor: Arc<dyn VSyncMonitor>) -> Arc<Self> {
        Self::build(task_queues, Box::new(TimerBackend::new()), VSyncState::whole_loop(monitor))
    }

    fn build(task_queues: Arc<TaskQueues>, backend: Box<dyn LoopBackend>, vsync: VSyncState) -> Arc<Self> {
        let internal_queue_id = task_queues.create_task_queue();
        let this = Arc::new_cyclic(|weak_self| Self {
            weak_self: Weak::clone(weak_self),
            task_queues,
            internal_queue_id,
            queue_ids: Mutex::new(Vec::new()),
            vsync_aligned_queue_ids: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            restriction_nanos: AtomicI64::new(TimeDelta::max().to_nanoseconds()),
            flush_depth: AtomicUsize::new(0),
            host_thread: thread::current().id(),
            backend,
            vsync,
        });
        this.bind(internal_queue_id);
        tracing::debug!(
            "Created message loop on {:?} with internal queue {}",
            this.host_thread,
            internal_queue_id
        );
        this
    }

    pub fn task_queues(&self) -> &Arc<TaskQueues> {
        &self.task_queues
    }

    /// Id of the queue the loop created for itself
    pub fn task_queue_id(&self) -> TaskQueueId {
        self.internal_queue_id
    }

    /// Queues flushed on every wakeup
    pub fn task_queue_ids(&self) -> Vec<TaskQueueId> {
        self.queue_ids.lock().clone()
    }

    /// Queues flushed only on VSync
    pub fn vsync_aligned_task_queue_ids(&self) -> Vec<TaskQueueId> {
        self.vsync_aligned_queue_ids.lock().clone()
    }

    /// Thread the loop was created on
    pub fn host_thread(&self) -> ThreadId {
        self.host_thread
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_vsync_loop(&self) -> bool {
        self.vsync.is_whole_loop()
    }

    pub fn has_vsync_monitor(&self) -> bool {
        self.vsync.has_monitor()
    }

    /// Route VSync-aligned queues bound from now on through `monitor`
    pub fn set_vsync_monitor(&self, monitor: Option<Arc<dyn VSyncMonitor>>) {
        self.vsync.set_monitor(monitor);
    }

    pub fn has_pending_vsync_request(&self) -> bool {
        self.vsync.has_pending_request()
    }

    pub fn restriction_duration(&self) -> TimeDelta {
        TimeDelta::from_nanoseconds(self.restriction_nanos.load(Ordering::Acquire))
    }

    /// Bound the time one `FlushType::All` flush may spend running tasks.
    /// `TimeDelta::max()` disables the bound.
    pub fn set_restriction_duration(&self, duration: TimeDelta) {
        self.restriction_nanos
            .store(duration.to_nanoseconds(), Ordering::Release);
    }

    /// Post onto the loop's internal queue
    pub fn post_task(&self, task: TaskFn, target_time: TimePoint, grade: TaskSourceGrade) {
        if self.is_terminated() {
            Self::run_after_termination(task);
            return;
        }
        if self
            .task_queues
            .register_task(self.internal_queue_id, task, target_time, grade)
            .is_err()
        {
            tracing::warn!("Internal queue {} of message loop is gone", self.internal_queue_id);
        }
    }

    /// Terminated loops never run posted work, so the caller runs it now
    /// whatever its target time. A task running this way that posts again has
    /// that post queued and run after it returns, never re-entered.
    pub(crate) fn run_after_termination(task: TaskFn) {
        let mut task = Some(task);
        let outermost = INLINE_PENDING
            .try_with(|pending| {
                let mut pending = pending.borrow_mut();
                match pending.as_mut() {
                    Some(queue) => {
                        queue.extend(task.take());
                        false
                    }
                    None => {
                        *pending = Some(VecDeque::new());
                        true
                    }
                }
            })
            .unwrap_or(false);
        let Some(task) = task else {
            tracing::trace!("Queued nested task posted to a terminated loop");
            return;
        };
        let _scope = outermost.then_some(InlineScope);
        task();
        if outermost {
            while let Some(next) = InlineScope::next() {
                next();
            }
        }
    }

    pub fn add_task_observer<F>(&self, key: ObserverKey, observer: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.task_queues
            .add_task_observer(self.internal_queue_id, key, Arc::new(observer));
    }

    pub fn remove_task_observer(&self, key: ObserverKey) {
        self.task_queues
            .remove_task_observer(self.internal_queue_id, key);
    }

    /// Serve `queue_id` from this loop and wake it if work is pending
    pub fn bind(&self, queue_id: TaskQueueId) {
        self.attach(queue_id);
        self.task_queues.wake_up_if_pending(queue_id);
    }

    /// Bind, then synchronously run the queue's expired tasks
    pub fn bind_and_run_expired(&self, queue_id: TaskQueueId) {
        self.attach(queue_id);
        let _scope = FlushScope::enter(self);
        let queue_ids = [queue_id];
        let now = TimePoint::now();
        while let Some(next) = self.task_queues.get_next_task_to_run(&queue_ids, now) {
            (next.task)();
            for observer in self.task_queues.get_observers_to_notify(next.task_queue_id) {
                observer();
            }
        }
    }

    fn attach(&self, queue_id: TaskQueueId) {
        let aligned = self.vsync.has_monitor()
            && queue_id != self.internal_queue_id
            && self.task_queues.is_task_queue_aligned_with_vsync(queue_id);
        {
            let mut ids = if aligned {
                self.vsync_aligned_queue_ids.lock()
            } else {
                self.queue_ids.lock()
            };
            if !ids.contains(&queue_id) {
                ids.push(queue_id);
            }
        }
        let wakeable: Weak<dyn Wakeable> = self.weak_self.clone();
        self.task_queues.set_wakeable(queue_id, Some(wakeable));
        tracing::trace!("Bound {} to message loop {} (vsync aligned: {})", queue_id, self.internal_queue_id, aligned);
    }

    /// Stop serving `queue_id`. Unknown ids are ignored.
    ///
    /// # Panics
    ///
    /// Unbinding the loop's internal queue is a programmer error.
    pub fn unbind(&self, queue_id: TaskQueueId) {
        assert_ne!(
            queue_id, self.internal_queue_id,
            "A message loop cannot unbind its own internal queue"
        );
        let removed = [&self.queue_ids, &self.vsync_aligned_queue_ids]
            .into_iter()
            .any(|ids| {
                let mut ids = ids.lock();
                let before = ids.len();
                ids.retain(|id| *id != queue_id);
                ids.len() != before
            });
        if removed {
            self.task_queues.set_wakeable(queue_id, None);
            tracing::trace!("Unbound {} from message loop {}", queue_id, self.internal_queue_id);
        }
    }

    /// True if this loop is the one allowed to run tasks on the calling thread
    pub fn can_run_now(&self) -> bool {
        super::current_loop_impl().is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), self))
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flush_depth.load(Ordering::Acquire) > 0
    }

    pub(crate) fn enter_flush(&self) -> Weak<Self> {
        self.flush_depth.fetch_add(1, Ordering::AcqRel);
        Weak::clone(&self.weak_self)
    }

    pub(crate) fn leave_flush(&self) {
        self.flush_depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Block the calling thread running the loop until terminated.
    ///
    /// A loop runs at most once. On return, tasks that already expired are
    /// run and the remaining tasks of the internal queue are dropped here.
    /// Queues of external runners keep their tasks for a later binding.
    pub fn do_run(&self) {
        if self.is_terminated() {
            return;
        }
        self.backend.run(&mut || self.on_backend_fire());
        self.terminated.store(true, Ordering::Release);
        self.run_expired_tasks_now();
        self.task_queues.dispose_tasks(self.internal_queue_id);
        tracing::debug!("Message loop {} finished", self.internal_queue_id);
    }

    pub fn do_terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.backend.terminate();
    }

    pub fn run_expired_tasks_now(&self) {
        self.flush_tasks(FlushType::All);
    }

    pub fn run_single_expired_task_now(&self) {
        self.flush_tasks(FlushType::Single);
    }

    /// Run expired tasks of the regular queues. A flush cut short by the
    /// restriction duration re-arms the loop.
    pub fn flush_tasks(&self, flush_type: FlushType) {
        let queue_ids = self.task_queue_ids();
        if self.flush_with_restriction(flush_type, &queue_ids, self.restriction_duration()) {
            tracing::trace!(
                "Flush of loop {} reached restriction duration {}",
                self.internal_queue_id,
                self.restriction_duration()
            );
            self.task_queues.wake_up(&queue_ids);
        }
    }

    /// Run expired tasks of the VSync-aligned queues within the frame share
    pub fn flush_vsync_aligned_tasks(&self, flush_type: FlushType) {
        let queue_ids = self.vsync_aligned_task_queue_ids();
        self.flush_with_restriction(flush_type, &queue_ids, self.vsync.aligned_budget());
    }

    /// Returns true if the flush stopped on the restriction bound
    fn flush_with_restriction(&self, flush_type: FlushType, queue_ids: &[TaskQueueId], restriction: TimeDelta) -> bool {
        if queue_ids.is_empty() {
            return false;
        }
        let _scope = FlushScope::enter(self);
        let now = TimePoint::now();
        loop {
            let Some(next) = self.task_queues.get_next_task_to_run(queue_ids, now) else {
                return false;
            };
            (next.task)();
            for observer in self.task_queues.get_observers_to_notify(next.task_queue_id) {
                observer();
            }
            if flush_type == FlushType::Single {
                return false;
            }
            if !restriction.is_max() && TimePoint::now() - now >= restriction {
                return true;
            }
        }
    }

    fn on_backend_fire(&self) {
        if self.vsync.take_frame_ready() {
            self.flush_vsync_aligned_tasks(FlushType::All);
        } else if self.vsync.waited_too_long(TimePoint::now()) {
            // The frame never came; serve aligned queues now and ask again later
            self.vsync.cancel_request();
            self.flush_vsync_aligned_tasks(FlushType::All);
        }
        self.run_expired_tasks_now();
        let aligned = self.vsync_aligned_task_queue_ids();
        if !aligned.is_empty() {
            self.task_queues.wake_up(&aligned);
        }
    }

    fn wake_up_through_vsync(&self, time_point: TimePoint) {
        let now = TimePoint::now();
        if time_point > now {
            self.backend.wake_up(time_point);
            return;
        }
        if self.vsync.waited_too_long(now) {
            tracing::warn!(
                "No VSync for {} on loop {}, waking by timer",
                WAITING_VSYNC_TIMEOUT,
                self.internal_queue_id
            );
            self.backend.wake_up(time_point);
            return;
        }
        let Some(monitor) = self.vsync.begin_request(now) else {
            return;
        };
        let weak = Weak::clone(&self.weak_self);
        monitor.request_vsync(Box::new(move |frame_start, frame_target| {
            if let Some(this) = weak.upgrade() {
                this.on_vsync(frame_start, frame_target);
            }
        }));
        // Hosts may stop delivering frames, e.g. while backgrounded
        self.backend.wake_up(now + WAITING_VSYNC_TIMEOUT);
    }

    fn on_vsync(&self, frame_start_ns: i64, frame_target_ns: i64) {
        let budget = self.vsync.on_frame(frame_start_ns, frame_target_ns);
        if self.vsync.is_whole_loop() {
            self.set_restriction_duration(budget.frame);
        }
        if self.can_run_now() && !self.is_flushing() {
            self.flush_vsync_aligned_tasks(FlushType::All);
            if self.vsync.is_whole_loop() {
                self.run_expired_tasks_now();
            }
        } else {
            self.vsync.mark_frame_ready();
            self.backend.wake_up(TimePoint::now());
        }
    }
}

impl Wakeable for MessageLoopImpl {
    fn wake_up(&self, time_point: TimePoint) {
        if self.vsync.is_whole_loop() {
            self.wake_up_through_vsync(time_point);
        } else {
            self.backend.wake_up(time_point);
        }
    }

    fn wake_up_by_vsync(&self, time_point: TimePoint) {
        if self.vsync.has_monitor() {
            self.wake_up_through_vsync(time_point);
        } else {
            self.backend.wake_up(time_point);
        }
    }
}

impl Drop for MessageLoopImpl {
    fn drop(&mut self) {
        let owner = self.task_queues.get_owner(self.internal_queue_id);
        if !owner.is_unmerged() {
            let _ = self.task_queues.unmerge(owner, self.internal_queue_id);
        }
        self.task_queues.dispose(self.internal_queue_id);
    }
}

impl fmt::Debug for MessageLoopImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLoopImpl")
            .field("internal_queue_id", &self.internal_queue_id)
            .field("queue_ids", &*self.queue_ids.lock())
            .field("vsync_aligned_queue_ids", &*self.vsync_aligned_queue_ids.lock())
            .field("terminated", &self.is_terminated())
            .field("host_thread", &self.host_thread)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsync_monitor::ManualVSyncMonitor;

    fn record(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TaskFn {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(tag))
    }

    #[test]
    fn test_flush_runs_expired_in_order() {
        let queues = Arc::new(TaskQueues::new());
        let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = TimePoint::now();
        message_loop.post_task(record(&log, 1), now, TaskSourceGrade::UserInteraction);
        message_loop.post_task(record(&log, 2), now, TaskSourceGrade::Emergency);
        message_loop.post_task(record(&log, 3), now + TimeDelta::from_seconds(60), TaskSourceGrade::Unspecified);

        message_loop.run_expired_tasks_now();
        assert_eq!(*log.lock(), vec![2, 1]);
        assert_eq!(queues.get_num_pending_tasks(message_loop.task_queue_id()), 1);
    }

    #[test]
    fn test_single_flush_runs_one_task() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = TimePoint::now();
        message_loop.post_task(record(&log, 1), now, TaskSourceGrade::Unspecified);
        message_loop.post_task(record(&log, 2), now, TaskSourceGrade::Unspecified);
        message_loop.run_single_expired_task_now();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_bind_unbind_round_trip() {
        let queues = Arc::new(TaskQueues::new());
        let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
        let before = message_loop.task_queue_ids();
        let queue_id = queues.create_task_queue();

        message_loop.bind(queue_id);
        assert!(queues.is_task_queue_running_on_given_message_loop(&*message_loop, queue_id));
        message_loop.unbind(queue_id);
        assert!(!queues.is_task_queue_running_on_given_message_loop(&*message_loop, queue_id));
        assert_eq!(message_loop.task_queue_ids(), before);
    }

    #[test]
    #[should_panic(expected = "own internal queue")]
    fn test_unbind_internal_queue_panics() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        message_loop.unbind(message_loop.task_queue_id());
    }

    #[test]
    fn test_observers_run_after_each_task() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let log = Arc::clone(&log);
            message_loop.add_task_observer(1, move || log.lock().push(100));
        }
        message_loop.post_task(record(&log, 1), TimePoint::now(), TaskSourceGrade::Unspecified);
        message_loop.post_task(record(&log, 2), TimePoint::now(), TaskSourceGrade::Unspecified);
        message_loop.run_expired_tasks_now();
        assert_eq!(*log.lock(), vec![1, 100, 2, 100]);

        message_loop.remove_task_observer(1);
        message_loop.post_task(record(&log, 3), TimePoint::now(), TaskSourceGrade::Unspecified);
        message_loop.run_expired_tasks_now();
        assert_eq!(log.lock().last(), Some(&3));
    }

    #[test]
    fn test_restriction_duration_bounds_flush() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        message_loop.set_restriction_duration(TimeDelta::from_milliseconds(4));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            message_loop.post_task(
                Box::new(move || {
                    thread::sleep(std::time::Duration::from_millis(1));
                    count.fetch_add(1, Ordering::SeqCst);
                }),
                TimePoint::now(),
                TaskSourceGrade::Unspecified,
            );
        }
        message_loop.run_expired_tasks_now();
        let first = count.load(Ordering::SeqCst);
        assert!((1..=5).contains(&first), "ran {} tasks", first);

        while count.load(Ordering::SeqCst) < 10 {
            message_loop.run_expired_tasks_now();
        }
    }

    #[test]
    fn test_terminated_loop_runs_every_post_inline() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        message_loop.do_terminate();
        let log = Arc::new(Mutex::new(Vec::new()));
        message_loop.post_task(record(&log, 1), TimePoint::now(), TaskSourceGrade::Unspecified);
        message_loop.post_task(
            record(&log, 2),
            TimePoint::now() + TimeDelta::from_seconds(60),
            TaskSourceGrade::Unspecified,
        );
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_nested_post_after_termination_runs_after_outer_task() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        message_loop.do_terminate();
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_loop = Arc::clone(&message_loop);
        let inner_log = Arc::clone(&log);
        message_loop.post_task(
            Box::new(move || {
                inner_log.lock().push(1);
                inner_loop.post_task(record(&inner_log, 3), TimePoint::now(), TaskSourceGrade::Unspecified);
                inner_log.lock().push(2);
            }),
            TimePoint::now(),
            TaskSourceGrade::Unspecified,
        );
        assert_eq!(*log.lock(), vec![1, 2, 3]);

        // The nesting state is cleared once the outer task returns
        message_loop.post_task(record(&log, 4), TimePoint::now(), TaskSourceGrade::Unspecified);
        assert_eq!(*log.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_do_run_keeps_external_queue_tasks() {
        let queues = Arc::new(TaskQueues::new());
        let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
        let external = queues.create_task_queue();
        message_loop.bind(external);
        let later = TimePoint::now() + TimeDelta::from_seconds(60);
        let log = Arc::new(Mutex::new(Vec::new()));
        message_loop.post_task(record(&log, 1), later, TaskSourceGrade::Unspecified);
        queues
            .register_task(external, record(&log, 2), later, TaskSourceGrade::Unspecified)
            .unwrap_or_else(|_| panic!("register_task failed"));

        let weak = Arc::downgrade(&message_loop);
        message_loop.post_task(
            Box::new(move || {
                if let Some(message_loop) = weak.upgrade() {
                    message_loop.do_terminate();
                }
            }),
            TimePoint::now(),
            TaskSourceGrade::Unspecified,
        );
        message_loop.do_run();
        assert!(message_loop.is_terminated());
        assert_eq!(queues.get_num_pending_tasks(message_loop.task_queue_id()), 0);
        assert_eq!(queues.get_num_pending_tasks(external), 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_terminated_loop_does_not_run_again() {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        message_loop.do_terminate();
        message_loop.do_run();
        assert!(message_loop.is_terminated());
    }

    #[test]
    fn test_drop_disposes_internal_queue() {
        let queues = Arc::new(TaskQueues::new());
        let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
        let queue_id = message_loop.task_queue_id();
        assert!(queues.contains(queue_id));
        drop(message_loop);
        assert!(!queues.contains(queue_id));
    }

    #[test]
    fn test_aligned_queue_waits_for_vsync() {
        let queues = Arc::new(TaskQueues::new());
        let monitor = Arc::new(ManualVSyncMonitor::new());
        let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
        message_loop.set_vsync_monitor(Some(monitor.clone() as Arc<dyn VSyncMonitor>));

        let queue_id = queues.create_task_queue();
        queues.set_task_queue_aligned_with_vsync(queue_id, true);
        message_loop.bind(queue_id);
        assert_eq!(message_loop.vsync_aligned_task_queue_ids(), vec![queue_id]);

        let log = Arc::new(Mutex::new(Vec::new()));
        queues
            .register_task(queue_id, record(&log, 1), TimePoint::now(), TaskSourceGrade::Unspecified)
            .unwrap_or_else(|_| panic!("register_task failed"));
        assert!(message_loop.has_pending_vsync_request());
        assert_eq!(monitor.pending_requests(), 1);

        message_loop.run_expired_tasks_now();
        assert!(log.lock().is_empty());

        // Delivered off the loop thread: the frame is flushed when the backend fires
        monitor.fire_frame(TimeDelta::from_milliseconds(16));
        assert!(log.lock().is_empty());
        message_loop.on_backend_fire();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_vsync_loop_sets_frame_budget() {
        let queues = Arc::new(TaskQueues::new());
        let monitor = Arc::new(ManualVSyncMonitor::new());
        let message_loop = MessageLoopImpl::new_vsync(Arc::clone(&queues), monitor.clone());
        assert!(message_loop.is_vsync_loop());

        let log = Arc::new(Mutex::new(Vec::new()));
        message_loop.post_task(record(&log, 1), TimePoint::now(), TaskSourceGrade::Unspecified);
        assert_eq!(monitor.pending_requests(), 1);

        // Not the thread's loop and not flushing: the frame is handed to the backend
        monitor.fire(0, 16_000_000);
        assert_eq!(message_loop.restriction_duration(), TimeDelta::from_milliseconds(16));
        message_loop.run_expired_tasks_now();
        assert_eq!(*log.lock(), vec![1]);
    }
}
