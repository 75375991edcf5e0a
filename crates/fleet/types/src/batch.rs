//! Batch and shard status types

use crate::{BatchId, JobStatus, ShardId};
use serde::{Deserialize, Serialize};

/// Per-status job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn slot(&mut self, status: JobStatus) -> &mut usize {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn add(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    /// Move one job from `from` to `to`.
    pub fn transition(&mut self, from: JobStatus, to: JobStatus) {
        let slot = self.slot(from);
        *slot = slot.saturating_sub(1);
        *self.slot(to) += 1;
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.retrying + self.cancelled
    }

    /// Jobs that reached a terminal state.
    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Aggregated status of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub total: usize,
    pub counts: StatusCounts,
    /// (completed + failed) / total, in percent
    pub percent_complete: f64,
    /// Every job is completed, failed or cancelled
    pub finished: bool,
    pub shard_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl BatchStatus {
    pub fn new(
        batch_id: BatchId,
        total: usize,
        counts: StatusCounts,
        shard_count: usize,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let percent_complete = if total == 0 {
            100.0
        } else {
            (counts.completed + counts.failed) as f64 / total as f64 * 100.0
        };

        Self {
            batch_id,
            total,
            counts,
            percent_complete,
            finished: counts.settled() >= total,
            shard_count,
            created_at,
        }
    }
}

/// Lifecycle of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// No job of the shard has been dispatched yet
    Pending,
    /// At least one job dispatched, some still open
    Running,
    /// Every job completed
    Completed,
    /// Every job settled, at least one failed or was cancelled
    CompletedWithErrors,
}

/// Status of one shard inside a massive submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    pub shard_id: ShardId,
    /// Offset of the shard's first job in the original submission
    pub offset: usize,
    pub total: usize,
    pub counts: StatusCounts,
    pub state: ShardState,
    pub progress_percent: f64,
    /// Errors of the shard's failed jobs
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_transition() {
        let mut counts = StatusCounts::default();
        counts.add(JobStatus::Queued);
        counts.add(JobStatus::Queued);
        counts.transition(JobStatus::Queued, JobStatus::Processing);
        counts.transition(JobStatus::Processing, JobStatus::Completed);

        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn test_batch_percent_complete() {
        let mut counts = StatusCounts::default();
        counts.completed = 3;
        counts.failed = 1;
        counts.queued = 4;
        let status = BatchStatus::new(BatchId::generate(), 8, counts, 0, chrono::Utc::now());

        assert_eq!(status.percent_complete, 50.0);
        assert!(!status.finished);
    }

    #[test]
    fn test_cancelled_settles_but_is_not_complete() {
        let mut counts = StatusCounts::default();
        counts.completed = 1;
        counts.cancelled = 1;
        let status = BatchStatus::new(BatchId::generate(), 2, counts, 0, chrono::Utc::now());

        assert_eq!(status.percent_complete, 50.0);
        assert!(status.finished);
    }
}
