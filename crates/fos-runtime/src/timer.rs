//! Timer
//!
//! Cancelable one-shot or repeating timer on a [`TaskRunner`]. Each start
//! bumps a validator; a firing whose captured validator is stale does nothing.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fos_base::TimeDelta;
use parking_lot::Mutex;

use crate::task_runner::TaskRunner;

/// Callback invoked by a timer
pub type TimerTask = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    running: AtomicBool,
    validator: AtomicU64,
    task: Mutex<Option<(TimerTask, TimeDelta)>>,
}

impl TimerState {
    fn is_current(&self, validator: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.validator.load(Ordering::Acquire) == validator
    }

    fn invalidate(&self) -> u64 {
        self.validator.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Timer posting its firings to a task runner
pub struct Timer {
    task_runner: Mutex<Option<Arc<TaskRunner>>>,
    state: Arc<TimerState>,
    repeating: bool,
}

impl Timer {
    pub fn new(task_runner: Option<Arc<TaskRunner>>) -> Self {
        Self::build(task_runner, false)
    }

    /// Timer that fires every `delay` until stopped
    pub fn repeating(task_runner: Option<Arc<TaskRunner>>) -> Self {
        Self::build(task_runner, true)
    }

    fn build(task_runner: Option<Arc<TaskRunner>>, repeating: bool) -> Self {
        Self {
            task_runner: Mutex::new(task_runner),
            state: Arc::new(TimerState {
                running: AtomicBool::new(false),
                validator: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
            repeating,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Runner for subsequent starts; a scheduled firing keeps its old runner
    pub fn set_task_runner(&self, task_runner: Option<Arc<TaskRunner>>) {
        *self.task_runner.lock() = task_runner;
    }

    /// Schedule `task` after `delay`, replacing any earlier schedule
    pub fn start<F>(&self, delay: TimeDelta, task: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.state.task.lock() = Some((Arc::new(task), delay));
        self.reset();
    }

    /// Restart with the remembered task and delay
    pub fn reset(&self) {
        let Some(task_runner) = self.task_runner.lock().clone() else {
            tracing::warn!("Timer started without a task runner");
            return;
        };
        let Some(delay) = self.state.task.lock().as_ref().map(|(_, delay)| *delay) else {
            tracing::warn!("Timer reset without a task");
            return;
        };
        let validator = self.state.invalidate();
        self.state.running.store(true, Ordering::Release);
        schedule(&task_runner, Arc::downgrade(&self.state), validator, delay, self.repeating);
    }

    pub fn stop(&self) {
        self.state.running.store(false, Ordering::Release);
        self.state.invalidate();
    }

    /// Run the task now. A one-shot timer stops; a repeating timer restarts
    /// its period from now.
    pub fn fire_immediately(&self) {
        let Some(task) = self.state.task.lock().as_ref().map(|(task, _)| Arc::clone(task)) else {
            return;
        };
        if self.repeating && self.is_running() {
            self.reset();
        } else {
            self.stop();
        }
        task();
    }
}

fn schedule(task_runner: &Arc<TaskRunner>, state: Weak<TimerState>, validator: u64, delay: TimeDelta, repeating: bool) {
    if task_runner.is_loop_terminated() {
        // A firing would run at once on the caller; the timer simply ends
        tracing::debug!("Timer runner {} has terminated, stopping timer", task_runner.task_queue_id());
        if let Some(state) = state.upgrade() {
            if state.validator.load(Ordering::Acquire) == validator {
                state.running.store(false, Ordering::Release);
            }
        }
        return;
    }
    let weak_runner = Arc::downgrade(task_runner);
    task_runner.post_delayed_task(
        move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            if !state.is_current(validator) {
                return;
            }
            let Some(task) = state.task.lock().as_ref().map(|(task, _)| Arc::clone(task)) else {
                return;
            };
            if repeating {
                // Next tick goes out first so the callback may stop the timer
                if let Some(task_runner) = weak_runner.upgrade() {
                    schedule(&task_runner, Arc::downgrade(&state), validator, delay, true);
                }
            } else {
                state.running.store(false, Ordering::Release);
            }
            task();
        },
        delay,
    );
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("running", &self.is_running())
            .field("repeating", &self.repeating)
            .field("validator", &self.state.validator.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_loop::MessageLoopImpl;
    use crate::task_queues::TaskQueues;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Arc<MessageLoopImpl>, Arc<TaskRunner>) {
        let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
        let runner = TaskRunner::for_loop(&message_loop);
        message_loop.run_expired_tasks_now();
        (message_loop, runner)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        (count, move || {
            sink.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (message_loop, runner) = setup();
        let timer = Timer::new(Some(runner));
        let (count, task) = counter();
        timer.start(TimeDelta::from_milliseconds(1), task);
        assert!(timer.is_running());
        thread::sleep(Duration::from_millis(5));
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_stop_prevents_firing() {
        let (message_loop, runner) = setup();
        let timer = Timer::new(Some(runner));
        let (count, task) = counter();
        timer.start(TimeDelta::from_milliseconds(1), task);
        timer.stop();
        thread::sleep(Duration::from_millis(5));
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_invalidates_earlier_schedule() {
        let (message_loop, runner) = setup();
        let timer = Timer::new(Some(runner));
        let (count, task) = counter();
        timer.start(TimeDelta::from_milliseconds(1), task);
        timer.reset();
        thread::sleep(Duration::from_millis(5));
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeating_stopped_from_callback() {
        let (message_loop, runner) = setup();
        let timer = Arc::new(Timer::repeating(Some(runner)));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let (weak, count) = (Arc::downgrade(&timer), Arc::clone(&count));
            timer.start(TimeDelta::zero(), move || {
                if count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    if let Some(timer) = weak.upgrade() {
                        timer.stop();
                    }
                }
            });
        }
        for _ in 0..6 {
            message_loop.run_expired_tasks_now();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_fire_immediately() {
        let (message_loop, runner) = setup();
        let timer = Timer::new(Some(runner));
        let (count, task) = counter();
        timer.start(TimeDelta::from_seconds(60), task);
        timer.fire_immediately();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_running());
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_without_runner_is_noop() {
        let timer = Timer::new(None);
        let (count, task) = counter();
        timer.start(TimeDelta::zero(), task);
        assert!(!timer.is_running());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timer_on_terminated_loop_stops() {
        let (message_loop, runner) = setup();
        let timer = Timer::repeating(Some(runner));
        let (count, task) = counter();
        message_loop.do_terminate();
        timer.start(TimeDelta::from_milliseconds(1), task);
        assert!(!timer.is_running());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_repeating_timer_stops_when_loop_terminates() {
        let (message_loop, runner) = setup();
        let timer = Timer::repeating(Some(runner));
        let (count, task) = counter();
        timer.start(TimeDelta::zero(), task);
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.is_running());

        // The final flush runs the pending tick, which cannot reschedule
        message_loop.do_terminate();
        message_loop.run_expired_tasks_now();
        assert!(!timer.is_running());
    }

    #[test]
    fn test_dropped_timer_does_not_fire() {
        let (message_loop, runner) = setup();
        let (count, task) = counter();
        {
            let timer = Timer::new(Some(runner));
            timer.start(TimeDelta::zero(), task);
        }
        message_loop.run_expired_tasks_now();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
