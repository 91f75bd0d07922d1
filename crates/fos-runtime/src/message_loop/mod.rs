//! Message Loop
//!
//! Thread-local facade over [`MessageLoopImpl`]. Each thread initializes at
//! most one loop; the facade also owns the thread's default task runner.

mod backend;
mod imp;
mod vsync;

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

pub use backend::{LoopBackend, TimerBackend};
pub use imp::{FlushType, MessageLoopImpl};
pub use vsync::{FrameBudget, TRAVERSAL_PROPORTION, WAITING_VSYNC_TIMEOUT};

use crate::task::TaskQueueId;
use crate::task_queues::TaskQueues;
use crate::task_runner::TaskRunner;

thread_local! {
    static CURRENT: RefCell<Option<MessageLoop>> = const { RefCell::new(None) };
    static FLUSHING: RefCell<Vec<Weak<MessageLoopImpl>>> = const { RefCell::new(Vec::new()) };
}

/// The loop of the current thread and its default runner
#[derive(Clone)]
pub struct MessageLoop {
    loop_impl: Arc<MessageLoopImpl>,
    task_runner: Arc<TaskRunner>,
}

impl MessageLoop {
    /// Initialize a default loop on this thread if there is none yet
    pub fn ensure_initialized_for_current_thread() -> MessageLoop {
        Self::ensure_initialized_with(|| MessageLoopImpl::new(TaskQueues::instance()))
    }

    /// Initialize this thread's loop with `create` if there is none yet.
    ///
    /// `create` runs on the current thread and is skipped when a loop exists.
    pub fn ensure_initialized_with<F>(create: F) -> MessageLoop
    where
        F: FnOnce() -> Arc<MessageLoopImpl>,
    {
        if let Some(existing) = Self::try_current() {
            return existing;
        }
        let loop_impl = create();
        let task_runner = TaskRunner::new(Arc::clone(loop_impl.task_queues()), None);
        let message_loop = MessageLoop {
            loop_impl: Arc::clone(&loop_impl),
            task_runner: Arc::clone(&task_runner),
        };
        CURRENT.with(|current| *current.borrow_mut() = Some(message_loop.clone()));
        // The loop is now current, so the runner binds in place
        task_runner.bind(loop_impl);
        message_loop
    }

    pub fn is_initialized_for_current_thread() -> bool {
        CURRENT
            .try_with(|current| current.borrow().is_some())
            .unwrap_or(false)
    }

    /// The loop of the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no loop; call
    /// [`MessageLoop::ensure_initialized_for_current_thread`] first.
    pub fn current() -> MessageLoop {
        match Self::try_current() {
            Some(message_loop) => message_loop,
            None => panic!("MessageLoop::ensure_initialized_for_current_thread was not called on this thread"),
        }
    }

    pub fn try_current() -> Option<MessageLoop> {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .ok()
            .flatten()
    }

    /// Detach the loop from this thread, returning it to the caller to drop
    pub fn reset_for_current_thread() -> Option<MessageLoop> {
        CURRENT
            .try_with(|current| current.borrow_mut().take())
            .ok()
            .flatten()
    }

    /// Block running the loop until it is terminated
    pub fn run(&self) {
        self.loop_impl.do_run();
    }

    pub fn terminate(&self) {
        self.loop_impl.do_terminate();
    }

    pub fn task_runner(&self) -> &Arc<TaskRunner> {
        &self.task_runner
    }

    pub fn loop_impl(&self) -> &Arc<MessageLoopImpl> {
        &self.loop_impl
    }

    pub fn task_queue_id(&self) -> TaskQueueId {
        self.loop_impl.task_queue_id()
    }

    pub fn run_expired_tasks_now(&self) {
        self.loop_impl.run_expired_tasks_now();
    }
}

impl fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLoop")
            .field("loop_impl", &self.loop_impl)
            .field("task_runner", &self.task_runner.task_queue_id())
            .finish()
    }
}

/// Loop allowed to run tasks on this thread: the innermost flushing loop,
/// else the thread's initialized loop
pub(crate) fn current_loop_impl() -> Option<Arc<MessageLoopImpl>> {
    let flushing = FLUSHING
        .try_with(|stack| stack.borrow().last().and_then(Weak::upgrade))
        .ok()
        .flatten();
    flushing.or_else(|| {
        CURRENT
            .try_with(|current| {
                current
                    .borrow()
                    .as_ref()
                    .map(|message_loop| Arc::clone(&message_loop.loop_impl))
            })
            .ok()
            .flatten()
    })
}

/// Marks a loop as flushing on this thread for the scope's lifetime
pub(crate) struct FlushScope<'a> {
    message_loop: &'a MessageLoopImpl,
    pushed: bool,
}

impl<'a> FlushScope<'a> {
    pub(crate) fn enter(message_loop: &'a MessageLoopImpl) -> Self {
        let weak = message_loop.enter_flush();
        let pushed = FLUSHING
            .try_with(|stack| stack.borrow_mut().push(weak))
            .is_ok();
        Self {
            message_loop,
            pushed,
        }
    }
}

impl Drop for FlushScope<'_> {
    fn drop(&mut self) {
        self.message_loop.leave_flush();
        if self.pushed {
            let _ = FLUSHING.try_with(|stack| stack.borrow_mut().pop());
        }
    }
}
