//! Concurrent Message Loop
//!
//! Fixed-size worker pool sharing one FIFO queue. Workers poll with staggered
//! intervals before parking on the condition variable, so short bursts are
//! picked up without waking the whole pool.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::task::TaskFn;
use crate::thread::{apply_thread_config, ThreadConfig, ThreadPriority};

/// Polling interval unit; worker `i` sleeps `(i + 1)` units between polls
const SLEEP_UNIT_MICROS: u64 = 340;

/// Total polling time a worker spends before parking
const POLL_WINDOW_MICROS: u64 = 34_000;

struct Shared {
    tasks: Mutex<VecDeque<TaskFn>>,
    condvar: Condvar,
    task_count: AtomicUsize,
    awake_workers: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    /// Claim a task if the counter says one is queued
    fn try_take(&self) -> Option<TaskFn> {
        self.task_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .ok()?;
        self.tasks.lock().pop_front()
    }

    fn park(&self) {
        let mut tasks = self.tasks.lock();
        self.awake_workers.fetch_sub(1, Ordering::AcqRel);
        while self.task_count.load(Ordering::Acquire) == 0 && !self.shutdown.load(Ordering::Acquire) {
            self.condvar.wait(&mut tasks);
        }
        self.awake_workers.fetch_add(1, Ordering::AcqRel);
    }

    fn worker_main(&self, index: usize) {
        let sleep_micros = SLEEP_UNIT_MICROS * (index as u64 + 1);
        let max_sleep_count = POLL_WINDOW_MICROS / sleep_micros;
        let mut sleep_countdown = 0;
        loop {
            if let Some(task) = self.try_take() {
                task();
                if self.task_count.load(Ordering::Acquire) > self.awake_workers.load(Ordering::Acquire) {
                    self.condvar.notify_one();
                }
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if sleep_countdown == 0 {
                self.park();
                sleep_countdown = max_sleep_count;
            } else {
                sleep_countdown -= 1;
                thread::sleep(Duration::from_micros(sleep_micros));
            }
        }
    }
}

/// Worker pool with adaptive idle sleep
pub struct ConcurrentMessageLoop {
    weak_self: Weak<ConcurrentMessageLoop>,
    name: String,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ConcurrentMessageLoop {
    /// Spawn `worker_count` workers (at least one) named `{name}{index}`
    pub fn create(name: &str, worker_count: usize, priority: ThreadPriority) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(Shared {
            tasks: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            task_count: AtomicUsize::new(0),
            awake_workers: AtomicUsize::new(worker_count),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let config = ThreadConfig::new(format!("{}{}", name, index)).with_priority(priority);
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || {
                    apply_thread_config(&config);
                    worker_shared.worker_main(index);
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // A worker that never starts is never awake
                    shared.awake_workers.fetch_sub(1, Ordering::AcqRel);
                    tracing::warn!("Failed to spawn worker {}{}: {}", name, index, err);
                }
            }
        }
        tracing::info!("Concurrent loop {} started with {} workers", name, workers.len());

        Arc::new_cyclic(|weak_self| Self {
            weak_self: Weak::clone(weak_self),
            name: name.to_string(),
            shared,
            workers: Mutex::new(workers),
            worker_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Workers not parked on the condition variable
    pub fn awake_worker_count(&self) -> usize {
        self.shared.awake_workers.load(Ordering::Acquire)
    }

    pub fn pending_task_count(&self) -> usize {
        self.shared.task_count.load(Ordering::Acquire)
    }

    pub fn task_runner(&self) -> Arc<ConcurrentTaskRunner> {
        Arc::new(ConcurrentTaskRunner {
            pool: Weak::clone(&self.weak_self),
        })
    }

    /// Queue a task; once shut down the task runs on the caller instead
    pub fn post_task(&self, task: TaskFn) {
        {
            let mut tasks = self.shared.tasks.lock();
            if !self.shared.shutdown.load(Ordering::Acquire) {
                tasks.push_back(task);
                self.shared.task_count.fetch_add(1, Ordering::AcqRel);
                if self.shared.awake_workers.load(Ordering::Acquire) == 0 {
                    self.shared.condvar.notify_one();
                }
                return;
            }
        }
        task();
    }

    /// Stop accepting work and join the workers once queued tasks drain
    pub fn terminate(&self) {
        {
            let _tasks = self.shared.tasks.lock();
            if self.shared.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
            self.shared.condvar.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("Worker of {} panicked", self.name);
            }
        }
        tracing::info!("Concurrent loop {} terminated", self.name);
    }
}

impl Drop for ConcurrentMessageLoop {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for ConcurrentMessageLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMessageLoop")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("awake", &self.awake_worker_count())
            .field("pending", &self.pending_task_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Handle posting into a pool without keeping it alive
#[derive(Debug, Clone)]
pub struct ConcurrentTaskRunner {
    pool: Weak<ConcurrentMessageLoop>,
}

impl ConcurrentTaskRunner {
    /// Queue onto the pool, or run inline if the pool is gone
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.upgrade() {
            Some(pool) => pool.post_task(Box::new(task)),
            None => task(),
        }
    }
}
