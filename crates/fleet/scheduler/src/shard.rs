//! Sharding of massive submissions.

use std::ops::Range;

use fleet_types::{JobStatus, ShardId, ShardState, ShardStatus, StatusCounts};

/// Split `len` items into `shards` contiguous ranges whose sizes differ by
/// at most one. Never yields an empty range.
pub fn partition(len: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = shards.clamp(1, len.max(1));
    if len == 0 {
        return Vec::new();
    }

    let base = len / shards;
    let extra = len % shards;
    let mut ranges = Vec::with_capacity(shards);
    let mut start = 0;
    for index in 0..shards {
        let size = base + usize::from(index < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Progress of one shard, kept alongside the batch.
#[derive(Debug, Clone)]
pub(crate) struct ShardRecord {
    pub shard_id: ShardId,
    pub offset: usize,
    pub total: usize,
    pub counts: StatusCounts,
    pub dispatched: bool,
    pub errors: Vec<String>,
}

impl ShardRecord {
    pub fn new(shard_id: ShardId, range: &Range<usize>) -> Self {
        let mut counts = StatusCounts::default();
        for _ in range.clone() {
            counts.add(JobStatus::Queued);
        }
        Self {
            shard_id,
            offset: range.start,
            total: range.len(),
            counts,
            dispatched: false,
            errors: Vec::new(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.counts.settled() >= self.total
    }

    pub fn state(&self) -> ShardState {
        if self.is_settled() {
            if self.counts.failed + self.counts.cancelled == 0 {
                ShardState::Completed
            } else {
                ShardState::CompletedWithErrors
            }
        } else if self.dispatched {
            ShardState::Running
        } else {
            ShardState::Pending
        }
    }

    pub fn status(&self) -> ShardStatus {
        let progress_percent = if self.total == 0 {
            100.0
        } else {
            (self.counts.completed + self.counts.failed) as f64 / self.total as f64 * 100.0
        };
        ShardStatus {
            shard_id: self.shard_id,
            offset: self.offset,
            total: self.total,
            counts: self.counts,
            state: self.state(),
            progress_percent,
            errors: self.errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::BatchId;
    use proptest::prelude::*;

    #[test]
    fn test_even_partition() {
        let ranges = partition(10_000, 10);
        assert_eq!(ranges.len(), 10);
        assert!(ranges.iter().all(|r| r.len() == 1000));
        assert_eq!(ranges[3], 3000..4000);
    }

    #[test]
    fn test_more_shards_than_items() {
        let ranges = partition(3, 10);
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
        assert!(partition(0, 10).is_empty());
    }

    #[test]
    fn test_shard_state_progression() {
        let mut shard = ShardRecord::new(ShardId::new(BatchId::generate(), 0), &(0..2));
        assert_eq!(shard.state(), ShardState::Pending);

        shard.dispatched = true;
        shard.counts.transition(JobStatus::Queued, JobStatus::Completed);
        assert_eq!(shard.state(), ShardState::Running);

        shard.counts.transition(JobStatus::Queued, JobStatus::Failed);
        assert_eq!(shard.state(), ShardState::CompletedWithErrors);
        assert_eq!(shard.status().progress_percent, 100.0);
    }

    proptest! {
        /// Ranges cover `0..len` in order, with no gap or overlap.
        #[test]
        fn partition_is_contiguous(len in 0usize..5000, shards in 0usize..64) {
            let ranges = partition(len, shards);

            let mut next = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, next);
                prop_assert!(!range.is_empty());
                next = range.end;
            }
            prop_assert_eq!(next, len);

            if len > 0 {
                prop_assert_eq!(ranges.len(), shards.clamp(1, len));
                let min = ranges.iter().map(|r| r.len()).min().unwrap_or(0);
                let max = ranges.iter().map(|r| r.len()).max().unwrap_or(0);
                prop_assert!(max - min <= 1);
            }
        }
    }
}
