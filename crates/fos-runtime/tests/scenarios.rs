//! End-to-end scenarios for fos-runtime
//!
//! Real threads and loops, bounded by waitable events and channel timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fos_base::{AutoResetWaitableEvent, TimeDelta, TimePoint};
use fos_runtime::{
    ConcurrentMessageLoop, FlushType, LoopKind, MessageLoopImpl, SharedThreadMerger, TaskQueues,
    TaskSourceGrade, Thread, ThreadConfig, ThreadPriority,
};
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn current_thread_name() -> String {
    thread::current().name().unwrap_or_default().to_string()
}

#[test]
fn test_priority_gating_on_running_loop() {
    init_tracing();
    let thread = Thread::spawn(ThreadConfig::new("fos-priority"), Arc::new(TaskQueues::new()), LoopKind::Default).unwrap();
    let (sender, receiver) = mpsc::channel();
    let target = TimePoint::now() + TimeDelta::from_milliseconds(20);
    for (label, grade) in [
        ("A", TaskSourceGrade::UserInteraction),
        ("B", TaskSourceGrade::Emergency),
        ("C", TaskSourceGrade::Microtask),
    ] {
        let sender = sender.clone();
        thread.task_runner().post_task_with(
            Box::new(move || {
                let _ = sender.send(label);
            }),
            target,
            grade,
        );
    }

    let order: Vec<&str> = (0..3)
        .map(|_| receiver.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(order, ["C", "B", "A"]);
}

#[test]
fn test_idle_waits_for_primary_inside_idle_period() {
    init_tracing();
    let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        Box::new(move || order.lock().push(label))
    };

    message_loop.post_task(record("I"), TimePoint::now(), TaskSourceGrade::Idle);
    message_loop.post_task(
        record("U"),
        TimePoint::now() + TimeDelta::from_milliseconds(30),
        TaskSourceGrade::UserInteraction,
    );
    message_loop.run_expired_tasks_now();
    assert!(order.lock().is_empty());

    thread::sleep(Duration::from_millis(35));
    message_loop.run_expired_tasks_now();
    assert_eq!(*order.lock(), ["U", "I"]);
}

#[test]
fn test_idle_runs_when_primary_is_beyond_idle_period() {
    init_tracing();
    let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        Box::new(move || order.lock().push(label))
    };

    message_loop.post_task(record("I"), TimePoint::now(), TaskSourceGrade::Idle);
    message_loop.post_task(
        record("U"),
        TimePoint::now() + TimeDelta::from_milliseconds(60),
        TaskSourceGrade::UserInteraction,
    );
    message_loop.run_expired_tasks_now();
    assert_eq!(*order.lock(), ["I"]);
}

#[test]
fn test_merged_queue_runs_on_owner_thread() {
    init_tracing();
    let queues = Arc::new(TaskQueues::new());
    let owner = Thread::spawn(ThreadConfig::new("fos-owner"), Arc::clone(&queues), LoopKind::Default).unwrap();
    let subsumed = Thread::spawn(ThreadConfig::new("fos-subsumed"), Arc::clone(&queues), LoopKind::Default).unwrap();
    let owner_id = owner.task_runner().task_queue_id();
    let subsumed_id = subsumed.task_runner().task_queue_id();

    // Keep the subsumed thread busy so the merge decides where the task runs
    let started = Arc::new(AutoResetWaitableEvent::new());
    let release = Arc::new(AutoResetWaitableEvent::new());
    {
        let (started, release) = (Arc::clone(&started), Arc::clone(&release));
        subsumed.task_runner().post_task(move || {
            started.signal();
            release.wait();
        });
    }
    started.wait();

    let (sender, receiver) = mpsc::channel();
    {
        let sender = sender.clone();
        subsumed.task_runner().post_task(move || {
            let _ = sender.send(current_thread_name());
        });
    }
    queues.merge(owner_id, subsumed_id).unwrap();
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), "fos-owner");

    release.signal();
    queues.unmerge(owner_id, subsumed_id).unwrap();
    subsumed.task_runner().post_task(move || {
        let _ = sender.send(current_thread_name());
    });
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), "fos-subsumed");
}

#[test]
fn test_restriction_duration_bounds_one_flush() {
    init_tracing();
    let message_loop = MessageLoopImpl::new(Arc::new(TaskQueues::new()));
    message_loop.set_restriction_duration(TimeDelta::from_milliseconds(4));
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let done = Arc::clone(&done);
        message_loop.post_task(
            Box::new(move || {
                thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            }),
            TimePoint::now(),
            TaskSourceGrade::Unspecified,
        );
    }

    message_loop.flush_tasks(FlushType::All);
    let first = done.load(Ordering::SeqCst);
    assert!((1..=5).contains(&first), "first flush ran {} tasks", first);

    for _ in 0..10 {
        if done.load(Ordering::SeqCst) == 10 {
            break;
        }
        message_loop.flush_tasks(FlushType::All);
    }
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

#[test]
fn test_concurrent_pool_scales_down_when_idle() {
    init_tracing();
    let pool = ConcurrentMessageLoop::create("fos-scaling", 4, ThreadPriority::Normal);
    let run_batch = |count: usize| {
        let done = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(AutoResetWaitableEvent::new());
        for _ in 0..count {
            let (done, event) = (Arc::clone(&done), Arc::clone(&event));
            pool.post_task(Box::new(move || {
                if done.fetch_add(1, Ordering::SeqCst) + 1 == count {
                    event.signal();
                }
            }));
        }
        assert!(!event.wait_with_timeout(TimeDelta::from_seconds(5)));
    };

    run_batch(16);
    run_batch(1);
    thread::sleep(Duration::from_millis(100));
    run_batch(1);

    let mut awake = pool.awake_worker_count();
    for _ in 0..100 {
        if awake <= 2 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
        awake = pool.awake_worker_count();
    }
    assert!(awake <= 2, "{} workers still awake", awake);
}

#[test]
fn test_lease_shared_merge() {
    init_tracing();
    let queues = Arc::new(TaskQueues::new());
    let owner = queues.create_task_queue();
    let subsumed = queues.create_task_queue();
    let merger = SharedThreadMerger::new(Arc::clone(&queues), owner, subsumed);
    const CALLER_A: u64 = 1;
    const CALLER_B: u64 = 2;

    assert!(merger.merge_with_lease(CALLER_A, 1));
    assert!(merger.merge_with_lease(CALLER_B, 1));

    assert!(merger.decrement_lease(CALLER_A));
    assert!(!merger.unmerge_now_if_last_one(CALLER_A));
    assert!(queues.owns(owner, subsumed));

    assert!(merger.decrement_lease(CALLER_B));
    assert!(merger.unmerge_now_if_last_one(CALLER_B));
    assert!(!queues.owns(owner, subsumed));
}
