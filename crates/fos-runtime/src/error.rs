//! Runtime Errors

use crate::task::TaskQueueId;

/// Why a merge or unmerge request was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("Unknown task queue: {0}")]
    UnknownQueue(TaskQueueId),

    #[error("Owner {owner} is already subsumed by {by}")]
    OwnerSubsumed { owner: TaskQueueId, by: TaskQueueId },

    #[error("Subsumed {subsumed} already owns {count} queue(s)")]
    SubsumedOwnsOthers { subsumed: TaskQueueId, count: usize },

    #[error("Subsumed {subsumed} is already subsumed by {by}")]
    SubsumedAlreadyMerged { subsumed: TaskQueueId, by: TaskQueueId },

    #[error("Owner {owner} does not own any queue")]
    OwnerOwnsNothing { owner: TaskQueueId },

    #[error("Subsumed {subsumed} is not merged")]
    SubsumedNotMerged { subsumed: TaskQueueId },

    #[error("Owner {owner} does not own {subsumed}")]
    NotOwned { owner: TaskQueueId, subsumed: TaskQueueId },
}

/// Runtime error
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Thread {0} exited before its message loop started")]
    ThreadExited(String),

    #[error(transparent)]
    Merge(#[from] MergeError),
}
