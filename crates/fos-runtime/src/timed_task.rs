//! Timed Task Manager
//!
//! setTimeout / setInterval style scheduling on a [`TaskRunner`], addressed
//! by integer handles. Handle 0 is never issued.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use fos_base::TimeDelta;
use parking_lot::Mutex;

use crate::task_runner::TaskRunner;

/// Handle returned by [`TimedTaskManager::set_timeout`] and
/// [`TimedTaskManager::set_interval`]
pub type TimedTaskHandle = u32;

type IntervalTask = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    last_handle: TimedTaskHandle,
    /// Live handles; interval entries carry their callback
    controllers: HashMap<TimedTaskHandle, Option<IntervalTask>>,
    executing: Option<TimedTaskHandle>,
    has_pending_remove_task: bool,
}

impl ManagerState {
    fn next_handle(&mut self) -> TimedTaskHandle {
        loop {
            self.last_handle = self.last_handle.wrapping_add(1);
            if self.last_handle != 0 && !self.controllers.contains_key(&self.last_handle) {
                return self.last_handle;
            }
        }
    }
}

/// Marks a handle as executing; removal requested meanwhile happens on exit
struct ExecutionScope {
    state: Arc<Mutex<ManagerState>>,
    handle: TimedTaskHandle,
    previous: Option<TimedTaskHandle>,
    previous_pending: bool,
    remove_on_exit: bool,
}

impl ExecutionScope {
    fn enter(state: Arc<Mutex<ManagerState>>, handle: TimedTaskHandle, remove_on_exit: bool) -> Self {
        let (previous, previous_pending) = {
            let mut guard = state.lock();
            let previous = guard.executing.replace(handle);
            (previous, std::mem::take(&mut guard.has_pending_remove_task))
        };
        Self {
            state,
            handle,
            previous,
            previous_pending,
            remove_on_exit,
        }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        let removed = {
            let mut guard = self.state.lock();
            let remove = self.remove_on_exit || guard.has_pending_remove_task;
            let removed = if remove { guard.controllers.remove(&self.handle) } else { None };
            guard.executing = self.previous;
            guard.has_pending_remove_task = self.previous_pending;
            removed
        };
        drop(removed);
    }
}

/// Handle-addressed timeouts and intervals
pub struct TimedTaskManager {
    task_runner: Arc<TaskRunner>,
    state: Arc<Mutex<ManagerState>>,
}

impl TimedTaskManager {
    pub fn new(task_runner: Arc<TaskRunner>) -> Self {
        Self {
            task_runner,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    /// Run `task` once after `delay_ms`
    pub fn set_timeout<F>(&self, task: F, delay_ms: i64) -> TimedTaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = {
            let mut state = self.state.lock();
            let handle = state.next_handle();
            state.controllers.insert(handle, None);
            handle
        };
        let weak = Arc::downgrade(&self.state);
        self.task_runner.post_delayed_task(
            move || {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                if !state.lock().controllers.contains_key(&handle) {
                    return;
                }
                let _scope = ExecutionScope::enter(state, handle, true);
                task();
            },
            delay(delay_ms),
        );
        handle
    }

    /// Run `task` every `delay_ms` until stopped
    pub fn set_interval<F>(&self, task: F, delay_ms: i64) -> TimedTaskHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = {
            let mut state = self.state.lock();
            let handle = state.next_handle();
            state.controllers.insert(handle, Some(Arc::new(task)));
            handle
        };
        schedule_interval(&self.task_runner, Arc::downgrade(&self.state), handle, delay(delay_ms));
        handle
    }

    /// Cancel `handle`. From inside the handle's own callback the removal is
    /// deferred until the callback returns.
    pub fn stop_task(&self, handle: TimedTaskHandle) {
        if handle == 0 {
            return;
        }
        let removed = {
            let mut state = self.state.lock();
            if state.executing == Some(handle) {
                state.has_pending_remove_task = true;
                None
            } else {
                state.controllers.remove(&handle)
            }
        };
        drop(removed);
    }

    pub fn stop_all_tasks(&self) {
        let controllers = std::mem::take(&mut self.state.lock().controllers);
        drop(controllers);
    }

    pub fn pending_task_count(&self) -> usize {
        self.state.lock().controllers.len()
    }

    /// True while `handle` may still fire
    pub fn is_valid(&self, handle: TimedTaskHandle) -> bool {
        let state = self.state.lock();
        let removing = state.executing == Some(handle) && state.has_pending_remove_task;
        handle != 0 && !removing && state.controllers.contains_key(&handle)
    }
}

fn delay(delay_ms: i64) -> TimeDelta {
    TimeDelta::from_milliseconds(delay_ms.max(0))
}

fn schedule_interval(
    task_runner: &Arc<TaskRunner>,
    state: Weak<Mutex<ManagerState>>,
    handle: TimedTaskHandle,
    delay: TimeDelta,
) {
    if task_runner.is_loop_terminated() {
        // Ticks would run back to back on the caller
        tracing::debug!("Interval {} ends with its terminated runner", handle);
        if let Some(state) = state.upgrade() {
            let removed = state.lock().controllers.remove(&handle);
            drop(removed);
        }
        return;
    }
    let weak_runner = Arc::downgrade(task_runner);
    task_runner.post_delayed_task(
        move || {
            let Some(strong) = state.upgrade() else {
                return;
            };
            let Some(Some(task)) = strong.lock().controllers.get(&handle).cloned() else {
                return;
            };
            if let Some(task_runner) = weak_runner.upgrade() {
                schedule_interval(&task_runner, state, handle, delay);
            }
            let _scope = ExecutionScope::enter(strong, handle, false);
            task();
        },
        delay,
    );
}

impl Drop for TimedTaskManager {
    fn drop(&mut self) {
        self.stop_all_tasks();
    }
}

impl fmt::Debug for TimedTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedTaskManager")
            .field("queue_id", &self.task_runner.task_queue_id())
            .field("pending", &self.pending_task_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_loop::MessageLoopImpl;
    use crate::task_queues::TaskQueues;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<MessageLoopImpl>, Arc<TimedTaskManager>) {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        let runner = TaskRunner::for_loop(&message_loop);
        message_loop.run_expired_tasks_now();
        (message_loop, Arc::new(TimedTaskManager::new(runner)))
    }

    #[test]
    fn test_timeout_runs_once_and_removes_itself() {
        let (message_loop, manager) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let handle = manager.set_timeout(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        assert_ne!(handle, 0);
        assert!(manager.is_valid(handle));
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!manager.is_valid(handle));
        assert_eq!(manager.pending_task_count(), 0);
    }

    #[test]
    fn test_stopped_timeout_does_not_run() {
        let (message_loop, manager) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let handle = manager.set_timeout(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            1,
        );
        manager.stop_task(handle);
        thread::sleep(Duration::from_millis(5));
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interval_stopped_from_own_callback() {
        let (message_loop, manager) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(Mutex::new(0));
        {
            let (weak, count, handle_slot) = (Arc::downgrade(&manager), Arc::clone(&count), Arc::clone(&handle));
            let slot = Arc::clone(&handle_slot);
            let handle = manager.set_interval(
                move || {
                    if count.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                        if let Some(manager) = weak.upgrade() {
                            let handle = *slot.lock();
                            manager.stop_task(handle);
                            assert!(!manager.is_valid(handle));
                        }
                    }
                },
                0,
            );
            *handle_slot.lock() = handle;
        }
        for _ in 0..5 {
            message_loop.run_expired_tasks_now();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(manager.pending_task_count(), 0);
    }

    #[test]
    fn test_stop_all_tasks() {
        let (message_loop, manager) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let sink = Arc::clone(&count);
            manager.set_timeout(
                move || {
                    sink.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
        }
        assert_eq!(manager.pending_task_count(), 3);
        manager.stop_all_tasks();
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interval_on_terminated_runner_ends() {
        let (message_loop, manager) = setup();
        message_loop.do_terminate();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let handle = manager.set_interval(
            move || {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );
        assert_ne!(handle, 0);
        assert!(!manager.is_valid(handle));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Timeouts still run on the caller
        manager.set_timeout(
            {
                let count = Arc::clone(&count);
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            50,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.pending_task_count(), 0);
    }

    #[test]
    fn test_handle_zero_is_noop() {
        let (_message_loop, manager) = setup();
        let handle = manager.set_timeout(|| {}, 10);
        manager.stop_task(0);
        assert!(!manager.is_valid(0));
        assert!(manager.is_valid(handle));
    }
}
