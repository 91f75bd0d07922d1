//! fOS Runtime
//!
//! Cooperative task scheduling for the fOS engine:
//! - Prioritized task queues in a process-wide registry, mergeable across threads
//! - Per-thread message loops with timer and VSync-aligned wakeups
//! - Task runners, threads and the concurrent worker pool
//! - Runner manufactor for the UI / JS / TASM / Layout threads
//! - Timers and setTimeout / setInterval style task management

pub mod concurrent_loop;
pub mod error;
pub mod manufactor;
pub mod merger;
pub mod message_loop;
pub mod task;
pub mod task_queues;
pub mod task_runner;
pub mod task_source;
pub mod thread;
pub mod timed_task;
pub mod timer;
pub mod vsync_monitor;
pub mod wakeable;

pub use concurrent_loop::{ConcurrentMessageLoop, ConcurrentTaskRunner};
pub use error::{MergeError, RuntimeError};
pub use manufactor::{
    ConcurrentLoopPriority, ManufactorConfig, TaskRunnerManufactor, ThreadStrategy, UIThread,
};
pub use merger::{MergerCallerId, SharedThreadMerger, ThreadMerger};
pub use message_loop::{
    FlushType, FrameBudget, LoopBackend, MessageLoop, MessageLoopImpl, TimerBackend,
};
pub use task::{TaskFn, TaskQueueId, TaskSourceGrade};
pub use task_queues::{ObserverKey, TaskObserver, TaskQueues};
pub use task_runner::{RunnerKind, TaskRunner};
pub use thread::{
    apply_thread_config, set_thread_config_setter, LoopKind, Thread, ThreadConfig,
    ThreadConfigSetter, ThreadPriority,
};
pub use timed_task::{TimedTaskHandle, TimedTaskManager};
pub use timer::{Timer, TimerTask};
pub use vsync_monitor::{
    ManualVSyncMonitor, PostingVSyncMonitor, TimerVSyncMonitor, VSyncCallback, VSyncMonitor,
};
pub use wakeable::Wakeable;

pub use fos_base::{TimeDelta, TimePoint};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
