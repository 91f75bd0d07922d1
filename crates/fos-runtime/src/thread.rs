//! Thread
//!
//! An OS thread hosting a message loop. Dropping a `Thread` terminates its
//! loop and joins the thread.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self as os_thread, JoinHandle};

use parking_lot::RwLock;

use crate::error::RuntimeError;
use crate::message_loop::{MessageLoop, MessageLoopImpl};
use crate::task_queues::TaskQueues;
use crate::task_runner::TaskRunner;
use crate::vsync_monitor::VSyncMonitor;

/// Scheduling priority requested for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadPriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
}

/// Hook run on a freshly spawned thread before its loop starts
pub type ThreadSetup = Arc<dyn Fn() + Send + Sync>;

/// Host callback that applies a [`ThreadConfig`] to the calling thread
pub type ThreadConfigSetter = Arc<dyn Fn(&ThreadConfig) + Send + Sync>;

/// Thread configuration
#[derive(Clone, Default)]
pub struct ThreadConfig {
    pub name: String,
    pub priority: ThreadPriority,
    pub setup: Option<ThreadSetup>,
}

impl ThreadConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: ThreadPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }
}

impl fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("has_setup", &self.setup.is_some())
            .finish()
    }
}

fn config_setter() -> &'static RwLock<Option<ThreadConfigSetter>> {
    static SETTER: OnceLock<RwLock<Option<ThreadConfigSetter>>> = OnceLock::new();
    SETTER.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide thread config setter, replacing any previous one
pub fn set_thread_config_setter(setter: Option<ThreadConfigSetter>) {
    *config_setter().write() = setter;
}

/// Apply `config` to the calling thread: the installed setter, then the
/// config's own setup hook
pub fn apply_thread_config(config: &ThreadConfig) {
    let setter = config_setter().read().clone();
    match setter {
        Some(setter) => setter(config),
        None => tracing::trace!(
            "No thread config setter, {} keeps default priority (requested {:?})",
            config.name,
            config.priority
        ),
    }
    if let Some(setup) = &config.setup {
        setup();
    }
}

/// Loop flavour hosted by a thread
#[derive(Clone, Default)]
pub enum LoopKind {
    #[default]
    Default,
    VSync(Arc<dyn VSyncMonitor>),
}

impl fmt::Debug for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::VSync(_) => write!(f, "VSync"),
        }
    }
}

/// OS thread running a message loop
pub struct Thread {
    name: String,
    handle: Option<JoinHandle<()>>,
    loop_impl: Arc<MessageLoopImpl>,
    task_runner: Arc<TaskRunner>,
}

impl Thread {
    /// Spawn a thread with a default loop on the process registry.
    ///
    /// # Panics
    ///
    /// Panics if the OS cannot spawn the thread, like [`std::thread::spawn`].
    pub fn new(config: ThreadConfig) -> Self {
        match Self::try_new(config) {
            Ok(thread) => thread,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn try_new(config: ThreadConfig) -> Result<Self, RuntimeError> {
        Self::spawn(config, TaskQueues::instance(), LoopKind::Default)
    }

    /// Spawn a thread whose loop uses `task_queues` and `kind`
    pub fn spawn(config: ThreadConfig, task_queues: Arc<TaskQueues>, kind: LoopKind) -> Result<Self, RuntimeError> {
        let name = config.name.clone();
        let (sender, receiver) = mpsc::channel();
        let handle = os_thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                apply_thread_config(&config);
                let message_loop = MessageLoop::ensure_initialized_with(move || match kind {
                    LoopKind::Default => MessageLoopImpl::new(task_queues),
                    LoopKind::VSync(monitor) => MessageLoopImpl::new_vsync(task_queues, monitor),
                });
                let started = (
                    Arc::clone(message_loop.loop_impl()),
                    Arc::clone(message_loop.task_runner()),
                );
                if sender.send(started).is_err() {
                    return;
                }
                message_loop.run();
                drop(message_loop);
                drop(MessageLoop::reset_for_current_thread());
            })
            .map_err(|source| RuntimeError::Spawn {
                name: name.clone(),
                source,
            })?;

        match receiver.recv() {
            Ok((loop_impl, task_runner)) => {
                tracing::debug!("Started thread {}", name);
                Ok(Self {
                    name,
                    handle: Some(handle),
                    loop_impl,
                    task_runner,
                })
            }
            Err(_) => {
                let _ = handle.join();
                Err(RuntimeError::ThreadExited(name))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default runner of the thread's loop
    pub fn task_runner(&self) -> &Arc<TaskRunner> {
        &self.task_runner
    }

    pub fn loop_impl(&self) -> &Arc<MessageLoopImpl> {
        &self.loop_impl
    }

    /// Terminate the loop and wait for the thread to exit
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.loop_impl.do_terminate();
        if handle.thread().id() == os_thread::current().id() {
            tracing::warn!("Thread {} joined from itself, detaching", self.name);
            return;
        }
        if handle.join().is_err() {
            tracing::warn!("Thread {} panicked", self.name);
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join();
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .field("queue_id", &self.task_runner.task_queue_id())
            .finish()
    }
}
