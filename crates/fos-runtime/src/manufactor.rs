//! Task Runner Manufactor
//!
//! Produces the UI, JS, TASM and Layout runners for a [`ThreadStrategy`],
//! backed by process-wide thread groups and the UI thread registration.
//! Also owns the two process-wide concurrent pools.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use fos_base::{Env, EnvKey};
use parking_lot::{Condvar, Mutex};

use crate::concurrent_loop::ConcurrentMessageLoop;
use crate::message_loop::{MessageLoop, MessageLoopImpl};
use crate::task_runner::TaskRunner;
use crate::thread::{Thread, ThreadConfig, ThreadPriority};
use crate::vsync_monitor::VSyncMonitor;

pub const JS_THREAD_NAME: &str = "Fos_JS";
pub const JS_WORKER_THREAD_PREFIX: &str = "Fos_JS_Worker-";
pub const TASM_THREAD_NAME: &str = "Fos_TASM";
pub const LAYOUT_THREAD_NAME: &str = "Fos_Layout";
pub const HIGH_PRIORITY_LOOP_NAME: &str = "FosHighTask";
pub const NORMAL_PRIORITY_LOOP_NAME: &str = "FosNormalTask";

/// Threads kept for the UI and JS threads
const RESERVED_THREADS: usize = 2;
const MIN_GROUP_THREADS: usize = 2;
const DEFAULT_LAYOUT_GROUP_THREADS: usize = 3;

/// Placement of TASM and Layout work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadStrategy {
    /// TASM and Layout run on the UI thread
    #[default]
    AllOnUi,
    /// TASM has its own thread, Layout runs on it
    MostOnTasm,
    /// TASM runs on the UI thread, Layout has its own thread
    PartOnLayout,
    /// TASM and Layout each have their own thread
    MultiThreads,
}

impl ThreadStrategy {
    pub fn tasm_on_ui(self) -> bool {
        matches!(self, Self::AllOnUi | Self::PartOnLayout)
    }

    pub fn layout_on_tasm(self) -> bool {
        matches!(self, Self::AllOnUi | Self::MostOnTasm)
    }
}

/// Manufactor configuration
#[derive(Debug, Clone, Default)]
pub struct ManufactorConfig {
    pub strategy: ThreadStrategy,

    /// Take TASM threads from the shared TASM group
    pub enable_multi_tasm_thread: bool,

    /// Take Layout threads from the shared Layout group
    pub enable_multi_layout_thread: bool,

    /// Use the UI thread's VSync-aligned runner
    pub enable_vsync_aligned_msg_loop: bool,

    /// JS group key; empty selects the process-wide JS thread
    pub js_group_thread_name: String,
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, |count| count.get())
}

/// Upper bound for any thread group
pub(crate) fn max_group_threads(hardware_threads: usize) -> usize {
    hardware_threads.saturating_sub(RESERVED_THREADS).max(MIN_GROUP_THREADS)
}

/// Group size from `key`, clamped to `1..=max`
pub(crate) fn configured_group_threads(env: &Env, key: EnvKey, default: usize, max: usize) -> usize {
    let requested = env.get_long(key, default as i64);
    usize::try_from(requested).unwrap_or(default).clamp(1, max)
}

pub(crate) fn high_priority_worker_count(env: &Env, hardware_threads: usize) -> usize {
    let mut percent = env.get_long(EnvKey::ConcurrentLoopHighPriorityWorkerCountPercent, 0);
    if !(1..=100).contains(&percent) {
        percent = if cfg!(target_pointer_width = "32") { 50 } else { 100 };
    }
    (hardware_threads * percent as usize / 100).max(1)
}

/// Lazily started threads sharing a name prefix
struct ThreadGroup {
    prefix: &'static str,
    threads: Mutex<Vec<Option<Thread>>>,
}

impl ThreadGroup {
    fn new(prefix: &'static str, max_count: usize) -> Self {
        tracing::info!("Thread group {} capped at {} threads", prefix, max_count);
        Self {
            prefix,
            threads: Mutex::new((0..max_count).map(|_| None).collect()),
        }
    }

    fn max_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Loop of the thread at `index`, starting that thread on first use
    fn loop_at(&self, index: usize) -> Arc<MessageLoopImpl> {
        let mut threads = self.threads.lock();
        let slot_count = threads.len();
        let slot = &mut threads[index % slot_count];
        let thread = slot.get_or_insert_with(|| {
            let name = format!("{}{}", self.prefix, index % slot_count);
            tracing::info!("Starting group thread {}", name);
            Thread::new(ThreadConfig::new(name).with_priority(ThreadPriority::High))
        });
        Arc::clone(thread.loop_impl())
    }

    /// Fresh runner on the thread at `index`
    fn runner(&self, index: usize) -> Arc<TaskRunner> {
        TaskRunner::for_loop(&self.loop_at(index))
    }
}

fn js_group() -> &'static ThreadGroup {
    static GROUP: OnceLock<ThreadGroup> = OnceLock::new();
    GROUP.get_or_init(|| ThreadGroup::new(JS_THREAD_NAME, max_group_threads(hardware_concurrency())))
}

fn tasm_group() -> &'static ThreadGroup {
    static GROUP: OnceLock<ThreadGroup> = OnceLock::new();
    GROUP.get_or_init(|| {
        let max = max_group_threads(hardware_concurrency());
        ThreadGroup::new(
            TASM_THREAD_NAME,
            configured_group_threads(Env::instance(), EnvKey::MultiTasmThreadSize, max, max),
        )
    })
}

fn layout_group() -> &'static ThreadGroup {
    static GROUP: OnceLock<ThreadGroup> = OnceLock::new();
    GROUP.get_or_init(|| {
        let max = max_group_threads(hardware_concurrency());
        ThreadGroup::new(
            LAYOUT_THREAD_NAME,
            configured_group_threads(
                Env::instance(),
                EnvKey::MultiLayoutThreadSize,
                DEFAULT_LAYOUT_GROUP_THREADS.min(max),
                max,
            ),
        )
    })
}

fn tasm_thread() -> &'static Thread {
    static THREAD: OnceLock<Thread> = OnceLock::new();
    THREAD.get_or_init(|| Thread::new(ThreadConfig::new(TASM_THREAD_NAME).with_priority(ThreadPriority::High)))
}

fn layout_thread() -> &'static Thread {
    static THREAD: OnceLock<Thread> = OnceLock::new();
    THREAD.get_or_init(|| Thread::new(ThreadConfig::new(LAYOUT_THREAD_NAME).with_priority(ThreadPriority::High)))
}

struct UiRunners {
    default: Arc<TaskRunner>,
    vsync: Arc<TaskRunner>,
}

fn ui_state() -> &'static (Mutex<Option<UiRunners>>, Condvar) {
    static UI: OnceLock<(Mutex<Option<UiRunners>>, Condvar)> = OnceLock::new();
    UI.get_or_init(|| (Mutex::new(None), Condvar::new()))
}

/// Process-wide registration of the host's UI thread
pub struct UIThread;

impl UIThread {
    /// Register the calling thread as the UI thread, initializing its loop.
    ///
    /// Later calls are ignored. With a monitor, the UI loop flushes its
    /// VSync-aligned runner on frames.
    pub fn init(monitor: Option<Arc<dyn VSyncMonitor>>) {
        let (lock, condvar) = ui_state();
        let mut runners = lock.lock();
        if runners.is_some() {
            tracing::debug!("UI thread already initialized");
            return;
        }
        let message_loop = MessageLoop::ensure_initialized_for_current_thread();
        let loop_impl = message_loop.loop_impl();
        if let Some(monitor) = monitor {
            loop_impl.set_vsync_monitor(Some(monitor));
        }
        *runners = Some(UiRunners {
            default: Arc::clone(message_loop.task_runner()),
            vsync: TaskRunner::new_vsync(Arc::clone(loop_impl.task_queues()), Some(Arc::clone(loop_impl))),
        });
        condvar.notify_all();
        tracing::info!("UI thread initialized");
    }

    pub fn is_initialized() -> bool {
        ui_state().0.lock().is_some()
    }

    /// UI runner, blocking until [`UIThread::init`] has run
    pub fn runner(enable_vsync: bool) -> Arc<TaskRunner> {
        let (lock, condvar) = ui_state();
        let mut runners = lock.lock();
        if runners.is_none() {
            tracing::info!("Waiting for UI thread initialization");
        }
        loop {
            if let Some(runners) = runners.as_ref() {
                let runner = if enable_vsync { &runners.vsync } else { &runners.default };
                return Arc::clone(runner);
            }
            condvar.wait(&mut runners);
        }
    }
}

/// Priority lane of the process-wide concurrent pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrentLoopPriority {
    High,
    Normal,
}

struct Runners {
    strategy: ThreadStrategy,
    tasm: Arc<TaskRunner>,
    layout: Arc<TaskRunner>,
}

/// Factory for one page's runners
pub struct TaskRunnerManufactor {
    config: ManufactorConfig,
    /// Picks this instance's thread in the multi TASM and Layout groups
    label: usize,
    ui: Arc<TaskRunner>,
    js: Arc<TaskRunner>,
    runners: Mutex<Runners>,
    tasm_loop: Mutex<Option<Arc<MessageLoopImpl>>>,
}

impl TaskRunnerManufactor {
    /// Build the runners for `config`; blocks until the UI thread is registered
    pub fn new(config: ManufactorConfig) -> Self {
        static LAST_LABEL: AtomicUsize = AtomicUsize::new(0);
        let label = LAST_LABEL.fetch_add(1, Ordering::Relaxed) + 1;
        let ui = UIThread::runner(config.enable_vsync_aligned_msg_loop);
        let js = Self::get_js_runner(&config.js_group_thread_name);
        let mut manufactor = Self {
            runners: Mutex::new(Runners {
                strategy: config.strategy,
                tasm: Arc::clone(&ui),
                layout: Arc::clone(&ui),
            }),
            config,
            label,
            ui,
            js,
            tasm_loop: Mutex::new(None),
        };
        let placed = manufactor.place_runners(manufactor.config.strategy);
        *manufactor.runners.get_mut() = placed;
        tracing::info!(
            "Task runner manufactor {} created with {:?} (multi tasm: {}, multi layout: {}, vsync aligned: {})",
            label,
            manufactor.config.strategy,
            manufactor.config.enable_multi_tasm_thread,
            manufactor.config.enable_multi_layout_thread,
            manufactor.config.enable_vsync_aligned_msg_loop
        );
        manufactor
    }

    pub fn config(&self) -> &ManufactorConfig {
        &self.config
    }

    pub fn label(&self) -> usize {
        self.label
    }

    pub fn strategy(&self) -> ThreadStrategy {
        self.runners.lock().strategy
    }

    pub fn ui_task_runner(&self) -> Arc<TaskRunner> {
        Arc::clone(&self.ui)
    }

    pub fn js_task_runner(&self) -> Arc<TaskRunner> {
        Arc::clone(&self.js)
    }

    pub fn tasm_task_runner(&self) -> Arc<TaskRunner> {
        Arc::clone(&self.runners.lock().tasm)
    }

    pub fn layout_task_runner(&self) -> Arc<TaskRunner> {
        Arc::clone(&self.runners.lock().layout)
    }

    /// Re-place TASM and Layout for `strategy` with fresh runners
    pub fn on_thread_strategy_updated(&self, strategy: ThreadStrategy) {
        let placed = self.place_runners(strategy);
        let mut runners = self.runners.lock();
        tracing::debug!("Thread strategy {:?} -> {:?}", runners.strategy, strategy);
        *runners = placed;
    }

    fn place_runners(&self, strategy: ThreadStrategy) -> Runners {
        let tasm_loop = if strategy.tasm_on_ui() {
            self.ui.get_loop()
        } else {
            Some(self.start_tasm_thread())
        };
        let tasm = match tasm_loop {
            Some(loop_impl) => self.create_tasm_runner(loop_impl),
            None => Arc::clone(&self.ui),
        };
        let layout = if strategy.layout_on_tasm() {
            Arc::clone(&tasm)
        } else {
            self.start_layout_thread()
        };
        Runners { strategy, tasm, layout }
    }

    fn create_tasm_runner(&self, loop_impl: Arc<MessageLoopImpl>) -> Arc<TaskRunner> {
        let task_queues = Arc::clone(loop_impl.task_queues());
        if self.config.enable_vsync_aligned_msg_loop {
            TaskRunner::new_vsync(task_queues, Some(loop_impl))
        } else {
            TaskRunner::new(task_queues, Some(loop_impl))
        }
    }

    fn start_tasm_thread(&self) -> Arc<MessageLoopImpl> {
        let loop_impl = if self.config.enable_multi_tasm_thread {
            tasm_group().loop_at(self.label)
        } else {
            Arc::clone(tasm_thread().loop_impl())
        };
        *self.tasm_loop.lock() = Some(Arc::clone(&loop_impl));
        loop_impl
    }

    fn start_layout_thread(&self) -> Arc<TaskRunner> {
        if self.config.enable_multi_layout_thread {
            layout_group().runner(self.label)
        } else {
            Arc::clone(layout_thread().task_runner())
        }
    }

    /// Loop of the TASM thread, starting it if needed
    pub fn tasm_loop(&self) -> Arc<MessageLoopImpl> {
        let started = self.tasm_loop.lock().clone();
        started.unwrap_or_else(|| self.start_tasm_thread())
    }

    /// JS runner for `group_name`; empty selects the process-wide JS thread
    pub fn get_js_runner(group_name: &str) -> Arc<TaskRunner> {
        match group_name.as_bytes().last() {
            None => {
                static JS_THREAD: OnceLock<Thread> = OnceLock::new();
                let thread = JS_THREAD.get_or_init(|| {
                    Thread::new(ThreadConfig::new(JS_THREAD_NAME).with_priority(ThreadPriority::High))
                });
                Arc::clone(thread.task_runner())
            }
            Some(&last) => {
                let group = js_group();
                group.runner(usize::from(last) % group.max_count())
            }
        }
    }

    /// Dedicated thread for one JS worker, owned by the caller
    pub fn create_js_worker_thread(worker_name: &str) -> Thread {
        Thread::new(ThreadConfig::new(format!("{}{}", JS_WORKER_THREAD_PREFIX, worker_name)))
    }

    /// Process-wide concurrent pool for `priority`
    pub fn concurrent_loop(priority: ConcurrentLoopPriority) -> Arc<ConcurrentMessageLoop> {
        static HIGH: OnceLock<Arc<ConcurrentMessageLoop>> = OnceLock::new();
        static NORMAL: OnceLock<Arc<ConcurrentMessageLoop>> = OnceLock::new();
        let pool = match priority {
            ConcurrentLoopPriority::High => HIGH.get_or_init(|| {
                ConcurrentMessageLoop::create(
                    HIGH_PRIORITY_LOOP_NAME,
                    high_priority_worker_count(Env::instance(), hardware_concurrency()),
                    ThreadPriority::High,
                )
            }),
            ConcurrentLoopPriority::Normal => NORMAL.get_or_init(|| {
                ConcurrentMessageLoop::create(NORMAL_PRIORITY_LOOP_NAME, 1, ThreadPriority::Normal)
            }),
        };
        Arc::clone(pool)
    }
}

impl fmt::Debug for TaskRunnerManufactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runners = self.runners.lock();
        f.debug_struct("TaskRunnerManufactor")
            .field("strategy", &runners.strategy)
            .field("ui", &self.ui.task_queue_id())
            .field("js", &self.js.task_queue_id())
            .field("tasm", &runners.tasm.task_queue_id())
            .field("layout", &runners.layout.task_queue_id())
            .finish()
    }
}
