//! Job records, batches and shards owned by the engine.
//!
//! Every status change goes through [`EngineState::transition`] so batch
//! and shard counters always agree with the job records.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use chrono::{DateTime, Utc};
use fleet_instance::PendingEmbed;
use fleet_types::{
    BatchId, BatchStatus, EmbedOutput, EventSeverity, FleetEvent, Job, JobId, JobSpec, JobStatus,
    ShardId, StatusCounts,
};
use tokio::time::Instant;

use crate::metrics::EngineMetrics;
use crate::queue::PriorityQueues;
use crate::shard::ShardRecord;

pub(crate) type PendingEvents = Vec<(FleetEvent, EventSeverity)>;

#[derive(Debug)]
pub(crate) struct BatchRecord {
    pub created_at: DateTime<Utc>,
    pub total: usize,
    pub counts: StatusCounts,
    pub jobs: Vec<JobId>,
    pub shards: Vec<ShardId>,
    /// Job records of this batch not yet purged
    pub retained: usize,
}

impl BatchRecord {
    pub fn status(&self, batch_id: BatchId) -> BatchStatus {
        BatchStatus::new(
            batch_id,
            self.total,
            self.counts,
            self.shards.len(),
            self.created_at,
        )
    }
}

/// Everything the dispatch loop decides on, behind one lock.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub jobs: HashMap<JobId, Job>,
    pub queues: PriorityQueues,
    pub batches: HashMap<BatchId, BatchRecord>,
    pub shards: HashMap<ShardId, ShardRecord>,
    /// Completed and cancelled jobs, in expiry order
    pub expiring_short: VecDeque<(Instant, JobId)>,
    /// Failed jobs, in expiry order
    pub expiring_long: VecDeque<(Instant, JobId)>,
    /// Batches submitted without jobs
    pub expiring_batches: VecDeque<(Instant, BatchId)>,
    pub metrics: EngineMetrics,
}

impl EngineState {
    pub fn new(priority_levels: u8) -> Self {
        Self {
            jobs: HashMap::new(),
            queues: PriorityQueues::new(priority_levels),
            batches: HashMap::new(),
            shards: HashMap::new(),
            expiring_short: VecDeque::new(),
            expiring_long: VecDeque::new(),
            expiring_batches: VecDeque::new(),
            metrics: EngineMetrics::default(),
        }
    }

    /// Record and enqueue a batch. `shards` must partition `specs` in order.
    pub fn insert_batch(
        &mut self,
        batch_id: BatchId,
        specs: Vec<JobSpec>,
        priority: u8,
        max_retries: u32,
        shards: &[Range<usize>],
    ) {
        let total = specs.len();
        let shard_ids: Vec<ShardId> = (0..shards.len())
            .map(|index| ShardId::new(batch_id, index as u32))
            .collect();
        for (shard_id, range) in shard_ids.iter().zip(shards) {
            self.shards
                .insert(*shard_id, ShardRecord::new(*shard_id, range));
        }

        let mut counts = StatusCounts::default();
        let mut job_ids = Vec::with_capacity(total);
        let mut shard_cursor = 0;
        for (index, spec) in specs.into_iter().enumerate() {
            while shard_cursor < shards.len() && index >= shards[shard_cursor].end {
                shard_cursor += 1;
            }
            let shard_id = shard_ids.get(shard_cursor).copied();
            let job_max_retries = spec.options.max_retries.unwrap_or(max_retries);

            let job = Job::new(spec, batch_id, shard_id, priority, job_max_retries);
            let job_id = job.id;
            counts.add(JobStatus::Queued);
            self.queues.push(priority, job_id);
            self.jobs.insert(job_id, job);
            job_ids.push(job_id);
        }

        self.metrics.submitted += total as u64;
        self.batches.insert(
            batch_id,
            BatchRecord {
                created_at: Utc::now(),
                total,
                counts,
                jobs: job_ids,
                shards: shard_ids,
                retained: total,
            },
        );
    }

    /// Move a job to `to`, keeping batch and shard counters in step.
    pub fn transition(&mut self, job_id: &JobId, to: JobStatus) -> Option<JobStatus> {
        let job = self.jobs.get_mut(job_id)?;
        let from = job.status;
        if from == to {
            return Some(from);
        }
        job.status = to;
        let (batch_id, shard_id) = (job.batch_id, job.shard_id);

        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.counts.transition(from, to);
        }
        if let Some(shard) = shard_id.and_then(|id| self.shards.get_mut(&id)) {
            shard.counts.transition(from, to);
        }
        Some(from)
    }

    /// Mark a popped job as owned by the instance behind `pending`.
    /// Returns the dispatch attempt number.
    pub fn start_processing(&mut self, job_id: &JobId, pending: &PendingEmbed) -> u32 {
        self.transition(job_id, JobStatus::Processing);
        self.metrics.dispatched += 1;

        let Some(job) = self.jobs.get_mut(job_id) else {
            return 0;
        };
        job.instance_id = Some(pending.instance_id());
        job.connection_id = Some(pending.connection_id());
        job.started_at = Some(Utc::now());
        job.ended_at = None;
        job.attempts += 1;
        let (attempt, shard_id) = (job.attempts, job.shard_id);

        if let Some(shard) = shard_id.and_then(|id| self.shards.get_mut(&id)) {
            shard.dispatched = true;
        }
        attempt
    }

    /// Close a processing job's connection fields. Returns the processing
    /// time in milliseconds.
    fn finish_processing(&mut self, job_id: &JobId) -> u64 {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return 0;
        };
        job.ended_at = Some(Utc::now());
        job.connection_id = None;
        job.processing_time_ms().unwrap_or(0) as u64
    }

    pub fn complete(
        &mut self,
        job_id: &JobId,
        output: EmbedOutput,
        expires_at: Instant,
        events: &mut PendingEvents,
    ) {
        let processing_ms = self.finish_processing(job_id);
        let instance_id = output.instance_id;
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.result = Some(output);
            job.error = None;
        }

        self.transition(job_id, JobStatus::Completed);
        self.metrics.record_success(processing_ms as f64);
        self.expiring_short.push_back((expires_at, *job_id));
        events.push((
            FleetEvent::JobCompleted {
                job_id: *job_id,
                instance_id,
                processing_ms,
            },
            EventSeverity::Info,
        ));
        self.settle(job_id, events);
    }

    /// Re-queue a failed job one bucket lower. Returns `false` when the job
    /// has no retries left.
    pub fn retry(
        &mut self,
        job_id: &JobId,
        error: String,
        lowest_priority: u8,
        events: &mut PendingEvents,
    ) -> bool {
        self.finish_processing(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if job.retry_count >= job.max_retries {
            return false;
        }
        job.retry_count += 1;
        job.priority = job.priority.saturating_add(1).min(lowest_priority);
        job.instance_id = None;
        job.error = Some(error.clone());
        let (retry_count, priority) = (job.retry_count, job.priority);

        self.transition(job_id, JobStatus::Retrying);
        self.queues.push(priority, *job_id);
        self.metrics.retried += 1;
        events.push((
            FleetEvent::JobRetrying {
                job_id: *job_id,
                retry_count,
                priority,
                error,
            },
            EventSeverity::Warning,
        ));
        true
    }

    /// Put a job back in its current bucket without consuming a retry.
    /// Used when its instance was shut down under it.
    pub fn requeue(&mut self, job_id: &JobId) {
        self.finish_processing(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.instance_id = None;
        let priority = job.priority;
        self.transition(job_id, JobStatus::Queued);
        self.queues.push(priority, *job_id);
    }

    pub fn fail(
        &mut self,
        job_id: &JobId,
        error: String,
        expires_at: Instant,
        events: &mut PendingEvents,
    ) {
        self.finish_processing(job_id);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.error = Some(error.clone());
        let shard_id = job.shard_id;

        self.queues.remove(job_id);
        self.transition(job_id, JobStatus::Failed);
        self.metrics.record_failure();
        if let Some(shard) = shard_id.and_then(|id| self.shards.get_mut(&id)) {
            shard.errors.push(error.clone());
        }
        self.expiring_long.push_back((expires_at, *job_id));
        events.push((
            FleetEvent::JobFailed {
                job_id: *job_id,
                error,
            },
            EventSeverity::Error,
        ));
        self.settle(job_id, events);
    }

    /// Cancel a waiting job. The caller removes it from the queues.
    pub fn cancel(&mut self, job_id: &JobId, expires_at: Instant, events: &mut PendingEvents) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.ended_at = Some(Utc::now());
        }
        self.transition(job_id, JobStatus::Cancelled);
        self.metrics.cancelled += 1;
        self.expiring_short.push_back((expires_at, *job_id));
        events.push((FleetEvent::JobCancelled { job_id: *job_id }, EventSeverity::Info));
        self.settle(job_id, events);
    }

    /// Announce shard and batch completion after a job became terminal.
    fn settle(&self, job_id: &JobId, events: &mut PendingEvents) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };

        if let Some(shard) = job.shard_id.and_then(|id| self.shards.get(&id)) {
            if shard.is_settled() {
                events.push((
                    FleetEvent::ShardFinished {
                        shard_id: shard.shard_id,
                        state: shard.state(),
                    },
                    EventSeverity::Info,
                ));
            }
        }
        if let Some(batch) = self.batches.get(&job.batch_id) {
            if batch.counts.settled() >= batch.total {
                events.push((
                    FleetEvent::BatchFinished {
                        batch_id: job.batch_id,
                        completed: batch.counts.completed,
                        failed: batch.counts.failed,
                    },
                    EventSeverity::Info,
                ));
            }
        }
    }

    /// Drop terminal jobs whose retention window ended.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for deque in [&mut self.expiring_short, &mut self.expiring_long] {
            while deque.front().is_some_and(|(at, _)| *at <= now) {
                if let Some((_, job_id)) = deque.pop_front() {
                    expired.push(job_id);
                }
            }
        }
        while self
            .expiring_batches
            .front()
            .is_some_and(|(at, _)| *at <= now)
        {
            if let Some((_, batch_id)) = self.expiring_batches.pop_front() {
                self.remove_batch_if_drained(&batch_id);
            }
        }
        expired.iter().filter(|id| self.remove_job(id)).count()
    }

    /// Schedule removal of a batch that holds no job record.
    pub fn expire_empty_batch(&mut self, batch_id: BatchId, expires_at: Instant) {
        if self
            .batches
            .get(&batch_id)
            .is_some_and(|batch| batch.retained == 0)
        {
            self.expiring_batches.push_back((expires_at, batch_id));
        }
    }

    fn remove_batch_if_drained(&mut self, batch_id: &BatchId) {
        let drained = self
            .batches
            .get(batch_id)
            .is_some_and(|batch| batch.retained == 0);
        if drained {
            if let Some(batch) = self.batches.remove(batch_id) {
                for shard_id in &batch.shards {
                    self.shards.remove(shard_id);
                }
            }
        }
    }

    fn remove_job(&mut self, job_id: &JobId) -> bool {
        let Some(job) = self.jobs.remove(job_id) else {
            return false;
        };

        if let Some(batch) = self.batches.get_mut(&job.batch_id) {
            batch.retained = batch.retained.saturating_sub(1);
        }
        self.remove_batch_if_drained(&job.batch_id);
        true
    }
}
