//! Error types for jobforge operations.
//!
//! Two subsystems, two enums:
//! - `JobError`: operations on a single job handle
//! - `QueueError`: queue, facade, and persistence operations
//!
//! Worker-side failures are carried by `WorkerError`, a plain
//! serializable message so it can ride inside job results and persistent
//! snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure produced by a worker function.
///
/// Delivered through the job's result rather than returned to the
/// caller, and retained in the job's output for late readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct WorkerError {
    /// Human-readable failure description.
    pub message: String,
}

impl WorkerError {
    /// Creates a new worker error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors that can occur on a single job handle.
#[derive(Debug, Error)]
pub enum JobError {
    /// The result channel was already handed out once.
    #[error("result channel has already been consumed")]
    AlreadyConsumed,

    /// Close was attempted while the job occupies a worker slot.
    #[error("job '{0}' is processing and cannot be closed")]
    ProcessingCannotClose(String),

    /// Close or a lifecycle operation hit a job that is already closed.
    #[error("job '{0}' is already closed")]
    AlreadyClosed(String),

    /// The job has no ack binding or its queue is not acknowledgeable.
    #[error("job '{0}' is not acknowledgeable")]
    NotAcknowledgeable(String),

    /// The back-end refused the acknowledgement.
    #[error("queue refused to acknowledge job '{id}' (ack id '{ack_id}')")]
    AckRejected { id: String, ack_id: String },

    /// The result channel closed without a value and no output was
    /// retained, which happens when a job is purged before running.
    #[error("job '{0}' was closed before producing a result")]
    ResultUnavailable(String),

    /// The worker function failed.
    #[error("worker failed: {0}")]
    WorkerFailed(#[from] WorkerError),
}

/// Errors that can occur during queue and facade operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No job is indexed under the requested id.
    #[error("job not found for id: {0}")]
    JobNotFound(String),

    /// No group job is indexed under the requested id.
    #[error("groups job not found for id: {0}")]
    GroupJobNotFound(String),

    /// The queue or back-end signalled back-pressure or is closed.
    #[error("queue rejected the enqueue")]
    EnqueueRejected,

    /// Persistent submissions must carry a stable id.
    #[error("a job id is required for persistent queues")]
    MissingJobId,

    /// A rehydrated snapshot carried a status outside the known set.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// Snapshot serialization or deserialization failed.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}
