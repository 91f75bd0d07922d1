//! Ordering, merge and shutdown properties of fos-runtime

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fos_base::{TimeDelta, TimePoint};
use fos_runtime::{
    MessageLoopImpl, SharedThreadMerger, TaskQueues, TaskRunner, TaskSourceGrade, TimedTaskManager, Timer,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Loop plus a runner whose bind has completed
fn bound_runner() -> (Arc<MessageLoopImpl>, Arc<TaskRunner>) {
    let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
    let runner = TaskRunner::for_loop(&message_loop);
    message_loop.run_expired_tasks_now();
    (message_loop, runner)
}

#[test]
fn test_merge_keeps_ownership_until_unmerge() {
    init_tracing();
    let queues = TaskQueues::new();
    let owner = queues.create_task_queue();
    let subsumed: Vec<_> = (0..8).map(|_| queues.create_task_queue()).collect();
    for &queue in &subsumed {
        queues.merge(owner, queue).unwrap();
        assert!(queues.owns(owner, queue));
        assert!(queues.get_subsumed_task_queue_ids(owner).contains(&queue));
    }
    for &queue in &subsumed {
        queues.unmerge(owner, queue).unwrap();
        assert!(!queues.owns(owner, queue));
        assert!(!queues.is_subsumed(queue));
    }
    assert!(queues.get_subsumed_task_queue_ids(owner).is_empty());
}

#[test]
fn test_lease_merge_unmerges_once_after_last_caller() {
    init_tracing();
    for callers in 1..=5u64 {
        let queues = Arc::new(TaskQueues::new());
        let owner = queues.create_task_queue();
        let subsumed = queues.create_task_queue();
        let merger = SharedThreadMerger::new(Arc::clone(&queues), owner, subsumed);
        for caller in 0..callers {
            assert!(merger.merge_with_lease(caller, (caller + 1) as usize));
        }
        let unmerges: Vec<bool> = (0..callers)
            .map(|caller| merger.unmerge_now_if_last_one(caller))
            .collect();
        let expected: Vec<bool> = (0..callers).map(|caller| caller + 1 == callers).collect();
        assert_eq!(unmerges, expected);
        assert!(!queues.owns(owner, subsumed));
    }
}

#[test]
fn test_same_grade_and_time_run_in_posting_order() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    let order = Arc::new(Mutex::new(Vec::new()));
    let target = TimePoint::now();
    for grade in [
        TaskSourceGrade::Unspecified,
        TaskSourceGrade::Emergency,
        TaskSourceGrade::Microtask,
        TaskSourceGrade::Idle,
    ] {
        order.lock().clear();
        for index in 0..16 {
            let order = Arc::clone(&order);
            runner.post_task_with(Box::new(move || order.lock().push(index)), target, grade);
        }
        message_loop.run_expired_tasks_now();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>(), "grade {:?}", grade);
    }
}

#[test]
fn test_higher_grade_runs_first_when_both_eligible() {
    init_tracing();
    let grades = [
        TaskSourceGrade::Microtask,
        TaskSourceGrade::Emergency,
        TaskSourceGrade::UserInteraction,
        TaskSourceGrade::Idle,
    ];
    for (first, &high) in grades.iter().enumerate() {
        for &low in &grades[first + 1..] {
            let (message_loop, runner) = bound_runner();
            let order = Arc::new(Mutex::new(Vec::new()));
            let target = TimePoint::now();
            for (label, grade) in [("low", low), ("high", high)] {
                let order = Arc::clone(&order);
                runner.post_task_with(Box::new(move || order.lock().push(label)), target, grade);
            }
            message_loop.run_expired_tasks_now();
            assert_eq!(*order.lock(), ["high", "low"], "{:?} vs {:?}", high, low);
        }
    }
}

#[test]
fn test_task_never_runs_before_target_time() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    let target = TimePoint::now() + TimeDelta::from_milliseconds(10);
    let ran_at = Arc::new(Mutex::new(None));
    {
        let ran_at = Arc::clone(&ran_at);
        runner.post_task_for_time(move || *ran_at.lock() = Some(TimePoint::now()), target);
    }
    while ran_at.lock().is_none() {
        message_loop.run_expired_tasks_now();
        thread::sleep(Duration::from_millis(1));
    }
    let ran_at = (*ran_at.lock()).unwrap_or_else(TimePoint::min);
    assert!(ran_at >= target);
}

#[test]
fn test_task_at_exactly_now_is_eligible() {
    init_tracing();
    let queues = TaskQueues::new();
    let queue = queues.create_task_queue();
    let now = TimePoint::now();
    assert!(queues
        .register_task(queue, Box::new(|| {}), now, TaskSourceGrade::Unspecified)
        .is_ok());
    assert!(queues.get_next_task_to_run(&[queue], now).is_some());
}

#[test]
fn test_post_to_terminated_loop_runs_synchronously() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    message_loop.do_terminate();
    let caller = thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    {
        let ran_on = Arc::clone(&ran_on);
        runner.post_task(move || *ran_on.lock() = Some(thread::current().id()));
    }
    assert_eq!(*ran_on.lock(), Some(caller));
}

#[test]
fn test_stopped_timer_never_fires() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    let fired = Arc::new(AtomicUsize::new(0));
    let timer = Timer::new(Some(runner));
    {
        let fired = Arc::clone(&fired);
        timer.start(TimeDelta::from_milliseconds(2), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    timer.stop();
    thread::sleep(Duration::from_millis(10));
    message_loop.run_expired_tasks_now();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_repeating_timer_stopped_in_callback_stays_stopped() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    let timer = Arc::new(Timer::repeating(Some(runner)));
    let fired = Arc::new(AtomicUsize::new(0));
    {
        let (weak, fired) = (Arc::downgrade(&timer), Arc::clone(&fired));
        timer.start(TimeDelta::from_milliseconds(1), move || {
            fired.fetch_add(1, Ordering::SeqCst);
            if let Some(timer) = weak.upgrade() {
                timer.stop();
            }
        });
    }
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(3));
        message_loop.run_expired_tasks_now();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interval_stopped_in_own_callback() {
    init_tracing();
    let (message_loop, runner) = bound_runner();
    let manager = Arc::new(TimedTaskManager::new(runner));
    let fired = Arc::new(AtomicUsize::new(0));
    let handle = Arc::new(Mutex::new(0));
    {
        let (weak, fired, slot) = (Arc::downgrade(&manager), Arc::clone(&fired), Arc::clone(&handle));
        *handle.lock() = manager.set_interval(
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                if let Some(manager) = weak.upgrade() {
                    manager.stop_task(*slot.lock());
                }
            },
            1,
        );
    }
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(3));
        message_loop.run_expired_tasks_now();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!manager.is_valid(*handle.lock()));
}

#[test]
fn test_bind_then_unbind_restores_loop() {
    init_tracing();
    let queues = Arc::new(TaskQueues::new());
    let message_loop = MessageLoopImpl::new(Arc::clone(&queues));
    let queue = queues.create_task_queue();
    let before = message_loop.task_queue_ids();

    message_loop.bind(queue);
    assert!(queues.is_task_queue_running_on_given_message_loop(&*message_loop, queue));
    message_loop.unbind(queue);

    assert_eq!(message_loop.task_queue_ids(), before);
    assert!(!queues.is_task_queue_running_on_given_message_loop(&*message_loop, queue));
}

#[test]
fn test_merge_then_unmerge_restores_registry() {
    init_tracing();
    let queues = TaskQueues::new();
    let owner = queues.create_task_queue();
    let subsumed = queues.create_task_queue();
    queues.merge(owner, subsumed).unwrap();
    queues.unmerge(owner, subsumed).unwrap();
    assert!(!queues.owns(owner, subsumed));
    assert!(!queues.is_subsumed(subsumed));
    assert!(queues.get_owner(subsumed).is_unmerged());
    assert!(queues.get_subsumed_task_queue_ids(owner).is_empty());
}

#[test]
fn test_create_then_dispose_restores_live_queues() {
    init_tracing();
    let queues = TaskQueues::new();
    let before = queues.get_all_queue_ids();
    let queue = queues.create_task_queue();
    queues.dispose(queue);
    assert_eq!(queues.get_all_queue_ids(), before);
}
