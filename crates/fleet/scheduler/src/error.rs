//! Error types for fleet-scheduler crate.

use std::time::Duration;

use fleet_pool::PoolError;
use fleet_types::{BatchId, JobId, JobStatus, SessionId};
use thiserror::Error;

/// Errors that can occur in the job engine.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Job is unknown or already purged.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Batch is unknown or every job of it was purged.
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Session is unknown or closed.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Job failed on every allowed attempt.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// Target was rejected before dispatch.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Submission would exceed the queue bound.
    #[error("queue full: {queued} queued, {requested} requested, limit {limit}")]
    QueueFull {
        queued: usize,
        requested: usize,
        limit: usize,
    },

    /// Priority outside the configured buckets.
    #[error("invalid priority {priority} (levels: {levels})")]
    InvalidPriority { priority: u8, levels: u8 },

    /// Job is processing or already finished.
    #[error("job {job_id} cannot be cancelled while {status}")]
    NotCancellable { job_id: JobId, status: JobStatus },

    /// Batch did not settle in time.
    #[error("batch {batch_id} not finished after {timeout:?}")]
    WaitTimeout { batch_id: BatchId, timeout: Duration },

    /// Engine is shutting down and refuses new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl SchedulerError {
    /// Status queries on purged or unknown IDs.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::JobNotFound(_)
                | SchedulerError::BatchNotFound(_)
                | SchedulerError::SessionNotFound(_)
        )
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
