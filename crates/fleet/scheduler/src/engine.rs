//! The parallel job engine.
//!
//! One serialized dispatch loop decides which job starts next; executions
//! run concurrently as spawned tasks and report back through
//! [`JobEngine::complete`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use fleet_instance::{ContentValidator, EmbedError, EmbedResult};
use fleet_pool::{InstancePool, PoolError};
use fleet_types::{
    BatchId, BatchStatus, EmbedOutput, EventSeverity, EventSource, FleetEvent,
    FleetEventEnvelope, Job, JobId, JobSpec, JobStatus, SessionId, ShardStatus,
};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::metrics::{EngineMetrics, SystemStatus};
use crate::session::SessionRecord;
use crate::shard::partition;
use crate::state::{EngineState, PendingEvents};

/// Priority bucket used for every shard of a massive submission.
const MASSIVE_PRIORITY: u8 = 1;

/// Dispatches queued jobs onto the instance pool.
pub struct JobEngine {
    config: SchedulerConfig,
    pub(crate) pool: Arc<InstancePool>,
    validator: Option<Arc<dyn ContentValidator>>,
    state: Mutex<EngineState>,
    in_flight: AtomicUsize,
    /// Woken whenever a job reaches a terminal state
    settled: Notify,
    pub(crate) sessions: DashMap<SessionId, SessionRecord>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobEngine {
    /// Create an engine dispatching onto `pool`.
    pub fn new(config: SchedulerConfig, pool: Arc<InstancePool>) -> Arc<Self> {
        Self::build(config, pool, None)
    }

    /// Create an engine that checks every target before dispatch.
    pub fn with_validator(
        config: SchedulerConfig,
        pool: Arc<InstancePool>,
        validator: Arc<dyn ContentValidator>,
    ) -> Arc<Self> {
        Self::build(config, pool, Some(validator))
    }

    fn build(
        config: SchedulerConfig,
        pool: Arc<InstancePool>,
        validator: Option<Arc<dyn ContentValidator>>,
    ) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::channel(10);
        Arc::new(Self {
            state: Mutex::new(EngineState::new(config.priority_levels)),
            config,
            pool,
            validator,
            in_flight: AtomicUsize::new(0),
            settled: Notify::new(),
            sessions: DashMap::new(),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the pool and the dispatch, purge and session loops.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.start().await?;

        let mut tasks = Vec::new();
        let trigger_rx = self
            .trigger_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(trigger_rx) = trigger_rx {
            tasks.push(self.spawn_dispatch_loop(trigger_rx));
        }
        tasks.extend(self.spawn_loop(
            "purge",
            self.config.purge_interval(),
            |engine| async move {
                engine.purge_tick();
            },
        ));
        tasks.extend(self.spawn_loop(
            "sessions",
            self.config.session_interval(),
            |engine| async move {
                engine.session_tick();
            },
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            priority_levels = self.config.priority_levels,
            "Job engine started"
        );
        Ok(())
    }

    fn spawn_dispatch_loop(self: &Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let weak: Weak<JobEngine> = Arc::downgrade(self);
        let period = self.config.dispatch_interval().max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    Some(_) = trigger_rx.recv() => {}
                }

                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                engine.dispatch_tick().await;
            }

            debug!("Dispatch loop stopped");
        })
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        tick: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn(Arc<JobEngine>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return None;
        }
        let weak: Weak<JobEngine> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                tick(engine).await;
            }

            debug!(task = name, "Engine loop stopped");
        }))
    }

    // ═══════════════════════════════════════════════════════════════════
    // SUBMISSION
    // ═══════════════════════════════════════════════════════════════════

    /// Queue `jobs` at `priority` under a fresh batch ID.
    ///
    /// Returns immediately; outcomes are observed through status queries or
    /// events. `max_retries` applies to jobs whose options do not set one.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub fn submit(
        &self,
        jobs: Vec<JobSpec>,
        priority: u8,
        max_retries: Option<u32>,
    ) -> SchedulerResult<BatchId> {
        self.check_accepting()?;
        let levels = self.config.priority_levels.max(1);
        if priority >= levels {
            return Err(SchedulerError::InvalidPriority { priority, levels });
        }

        let count = jobs.len();
        let batch_id = BatchId::generate();
        {
            let mut state = self.lock_state();
            self.check_queue_bound(&state, count)?;
            state.insert_batch(
                batch_id,
                jobs,
                priority,
                max_retries.unwrap_or(self.config.default_max_retries),
                &[],
            );
            if count == 0 {
                let expires_at = Instant::now() + self.config.success_retention();
                state.expire_empty_batch(batch_id, expires_at);
            }
        }

        info!(batch_id = %batch_id, jobs = count, priority, "Batch submitted");
        self.emit(
            FleetEvent::BatchSubmitted {
                batch_id,
                jobs: count,
                priority,
                shards: 0,
            },
            EventSeverity::Info,
        );

        if count <= self.config.nudge_max_jobs
            && self.in_flight() < self.config.nudge_in_flight_threshold
        {
            self.nudge();
        }
        Ok(batch_id)
    }

    /// Split `jobs` into contiguous shards tracked independently and queue
    /// them at priority 1. The batch finishes once every shard has settled.
    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    pub fn submit_massive(
        &self,
        jobs: Vec<JobSpec>,
        shard_count: Option<usize>,
        max_retries: Option<u32>,
    ) -> SchedulerResult<BatchId> {
        self.check_accepting()?;
        let count = jobs.len();
        let priority = MASSIVE_PRIORITY.min(self.config.lowest_priority());
        let ranges = partition(count, shard_count.unwrap_or(self.config.shard_count));
        let batch_id = BatchId::generate();
        {
            let mut state = self.lock_state();
            self.check_queue_bound(&state, count)?;
            state.insert_batch(
                batch_id,
                jobs,
                priority,
                max_retries.unwrap_or(self.config.default_max_retries),
                &ranges,
            );
            if count == 0 {
                let expires_at = Instant::now() + self.config.success_retention();
                state.expire_empty_batch(batch_id, expires_at);
            }
        }

        info!(batch_id = %batch_id, jobs = count, shards = ranges.len(), "Massive batch submitted");
        self.emit(
            FleetEvent::BatchSubmitted {
                batch_id,
                jobs: count,
                priority,
                shards: ranges.len(),
            },
            EventSeverity::Info,
        );
        Ok(batch_id)
    }

    fn check_accepting(&self) -> SchedulerResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }

    fn check_queue_bound(&self, state: &EngineState, requested: usize) -> SchedulerResult<()> {
        let Some(limit) = self.config.max_queued_jobs else {
            return Ok(());
        };
        let queued = state.queues.len();
        if queued + requested > limit {
            warn!(queued, requested, limit, "Submission rejected, queue full");
            return Err(SchedulerError::QueueFull {
                queued,
                requested,
                limit,
            });
        }
        Ok(())
    }

    /// Ask the dispatch loop to run now instead of at its next tick.
    fn nudge(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            debug!("Dispatch already nudged");
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // DISPATCH
    // ═══════════════════════════════════════════════════════════════════

    /// One pass of the dispatch loop. Returns the number of jobs started.
    ///
    /// Buckets are drained in strict priority order while the global
    /// concurrency ceiling and the per-tick batch size allow. When no
    /// instance can take work the remaining jobs stay queued.
    pub async fn dispatch_tick(self: &Arc<Self>) -> usize {
        if self.shutting_down.load(Ordering::SeqCst) {
            return 0;
        }

        let mut started = Vec::new();
        let mut events: PendingEvents = Vec::new();
        let mut pool_empty = false;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            let failure_expiry = Instant::now() + self.config.failure_retention();
            let mut budget = self.config.batch_size.max(1);

            while budget > 0 && self.in_flight() < self.config.max_concurrent_jobs {
                let Some((_, job_id)) = state.queues.peek() else {
                    break;
                };
                let Some((target, options)) = state
                    .jobs
                    .get(&job_id)
                    .map(|job| (job.target.clone(), job.options.clone()))
                else {
                    state.queues.pop();
                    continue;
                };

                if let Some(validator) = &self.validator {
                    let verdict = validator.validate(&target);
                    if !verdict.ok {
                        state.queues.pop();
                        state.metrics.rejected += 1;
                        let reason = verdict
                            .reason
                            .unwrap_or_else(|| "rejected by validator".to_string());
                        debug!(job_id = %job_id, reason = %reason, "Job rejected before dispatch");
                        state.fail(
                            &job_id,
                            SchedulerError::ValidationFailed(reason).to_string(),
                            failure_expiry,
                            &mut events,
                        );
                        continue;
                    }
                }

                match self.pool.assign(None, target, options, Some(job_id)) {
                    Ok(pending) => {
                        state.queues.pop();
                        let attempt = state.start_processing(&job_id, &pending);
                        self.in_flight.fetch_add(1, Ordering::SeqCst);
                        events.push((
                            FleetEvent::JobDispatched {
                                job_id,
                                instance_id: pending.instance_id(),
                                attempt,
                            },
                            EventSeverity::Debug,
                        ));
                        started.push((job_id, pending));
                        budget -= 1;
                    }
                    Err(PoolError::NoAvailableInstance) => {
                        pool_empty = self.pool.ready_count() == 0;
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "Dispatch paused");
                        break;
                    }
                }
            }
        }

        self.emit_all(events);
        let count = started.len();
        for (job_id, pending) in started {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let result = pending.run().await;
                engine.complete(job_id, result);
            });
        }
        if count > 0 {
            debug!(dispatched = count, in_flight = self.in_flight(), "Dispatch tick");
        }

        if pool_empty && self.config.auto_create_instances && !self.pool.is_shutting_down() {
            match self.pool.create_instance().await {
                Ok(instance_id) => {
                    info!(instance_id = %instance_id, "Created instance for queued jobs")
                }
                Err(e) => debug!(error = %e, "Could not create instance for queued jobs"),
            }
        }
        count
    }

    /// Record the outcome of one execution.
    ///
    /// Failures are re-queued one bucket lower until the job's retries are
    /// used up, after which the job is failed for good. A job whose instance
    /// was retired or shut down goes back to its bucket untouched.
    #[instrument(skip(self, result))]
    pub(crate) fn complete(&self, job_id: JobId, result: EmbedResult<EmbedOutput>) {
        let mut events: PendingEvents = Vec::new();
        {
            let mut state = self.lock_state();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let now = Instant::now();

            match result {
                Ok(output) => {
                    state.complete(
                        &job_id,
                        output,
                        now + self.config.success_retention(),
                        &mut events,
                    );
                }
                // Instance shut down under the job: not a failed attempt
                Err(EmbedError::Cancelled) => {
                    debug!(
                        engine_shutdown = self.is_shutting_down(),
                        "Execution cancelled by instance shutdown, job re-queued"
                    );
                    state.requeue(&job_id);
                }
                Err(e) => {
                    let error = e.to_string();
                    let lowest = self.config.lowest_priority();
                    if !state.retry(&job_id, error.clone(), lowest, &mut events) {
                        let attempts = state.jobs.get(&job_id).map_or(0, |job| job.attempts);
                        warn!(attempts, error = %error, "Job failed");
                        state.fail(
                            &job_id,
                            SchedulerError::RetryExhausted {
                                attempts,
                                last_error: error,
                            }
                            .to_string(),
                            now + self.config.failure_retention(),
                            &mut events,
                        );
                    }
                }
            }
        }

        self.emit_all(events);
        self.settled.notify_waiters();
    }

    // ═══════════════════════════════════════════════════════════════════
    // CANCELLATION
    // ═══════════════════════════════════════════════════════════════════

    /// Cancel a queued or retrying job. Cancelling twice is a no-op.
    pub fn cancel_job(&self, job_id: &JobId) -> SchedulerResult<()> {
        let mut events: PendingEvents = Vec::new();
        {
            let mut state = self.lock_state();
            let status = state
                .jobs
                .get(job_id)
                .map(|job| job.status)
                .ok_or(SchedulerError::JobNotFound(*job_id))?;

            match status {
                JobStatus::Cancelled => return Ok(()),
                s if s.is_waiting() => {
                    state.queues.remove(job_id);
                    let expires_at = Instant::now() + self.config.success_retention();
                    state.cancel(job_id, expires_at, &mut events);
                }
                s => {
                    return Err(SchedulerError::NotCancellable {
                        job_id: *job_id,
                        status: s,
                    })
                }
            }
        }

        info!(job_id = %job_id, "Job cancelled");
        self.emit_all(events);
        self.settled.notify_waiters();
        Ok(())
    }

    /// Cancel every waiting job of a batch. Returns how many were cancelled.
    pub fn cancel_batch(&self, batch_id: &BatchId) -> SchedulerResult<usize> {
        let mut events: PendingEvents = Vec::new();
        let cancelled = {
            let mut state = self.lock_state();
            let state = &mut *state;
            let batch = state
                .batches
                .get(batch_id)
                .ok_or(SchedulerError::BatchNotFound(*batch_id))?;
            let waiting: Vec<JobId> = batch
                .jobs
                .iter()
                .filter(|id| state.jobs.get(*id).is_some_and(|job| job.status.is_waiting()))
                .copied()
                .collect();

            let doomed: HashSet<JobId> = waiting.iter().copied().collect();
            state.queues.remove_all(&doomed);
            let expires_at = Instant::now() + self.config.success_retention();
            for job_id in &waiting {
                state.cancel(job_id, expires_at, &mut events);
            }
            waiting.len()
        };

        info!(batch_id = %batch_id, cancelled, "Batch cancelled");
        self.emit_all(events);
        self.settled.notify_waiters();
        Ok(cancelled)
    }

    // ═══════════════════════════════════════════════════════════════════
    // STATUS
    // ═══════════════════════════════════════════════════════════════════

    pub fn job_status(&self, job_id: &JobId) -> SchedulerResult<Job> {
        self.lock_state()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or(SchedulerError::JobNotFound(*job_id))
    }

    /// Per-status counts and percent complete of a batch.
    pub fn batch_status(&self, batch_id: &BatchId) -> SchedulerResult<BatchStatus> {
        self.lock_state()
            .batches
            .get(batch_id)
            .map(|batch| batch.status(*batch_id))
            .ok_or(SchedulerError::BatchNotFound(*batch_id))
    }

    /// Job IDs of a batch in submission order.
    pub fn batch_jobs(&self, batch_id: &BatchId) -> SchedulerResult<Vec<JobId>> {
        self.lock_state()
            .batches
            .get(batch_id)
            .map(|batch| batch.jobs.clone())
            .ok_or(SchedulerError::BatchNotFound(*batch_id))
    }

    /// Status of every shard of a massive batch, in partition order.
    pub fn shard_status(&self, batch_id: &BatchId) -> SchedulerResult<Vec<ShardStatus>> {
        let state = self.lock_state();
        let batch = state
            .batches
            .get(batch_id)
            .ok_or(SchedulerError::BatchNotFound(*batch_id))?;
        Ok(batch
            .shards
            .iter()
            .filter_map(|id| state.shards.get(id))
            .map(|shard| shard.status())
            .collect())
    }

    pub fn system_status(&self) -> SystemStatus {
        let (queue_depths, queued, tracked_jobs, batches, metrics) = {
            let state = self.lock_state();
            (
                state.queues.depths(),
                state.queues.len(),
                state.jobs.len(),
                state.batches.len(),
                state.metrics.clone(),
            )
        };

        SystemStatus {
            queue_depths,
            queued,
            in_flight: self.in_flight(),
            max_concurrent_jobs: self.config.max_concurrent_jobs,
            tracked_jobs,
            batches,
            sessions: self.sessions.len(),
            metrics,
            pool: self.pool.status(),
        }
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.lock_state().metrics.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve once every job of the batch is completed, failed or cancelled.
    pub async fn wait_for_batch(
        &self,
        batch_id: &BatchId,
        timeout: Duration,
    ) -> SchedulerResult<BatchStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.batch_status(batch_id)?;
            if status.finished {
                return Ok(status);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::WaitTimeout {
                    batch_id: *batch_id,
                    timeout,
                });
            }
        }
    }

    /// Drop terminal jobs whose retention window ended.
    pub fn purge_tick(&self) -> usize {
        let purged = self.lock_state().purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, "Purged expired jobs");
        }
        purged
    }

    // ═══════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEventEnvelope> {
        self.pool.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the loops, close sessions and shut the pool down with `grace`.
    ///
    /// Jobs interrupted by the pool shutdown go back to their queue.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
        self.sessions.clear();

        self.pool.shutdown(grace).await;
        info!(queued = self.lock_state().queues.len(), "Job engine shut down");
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: FleetEvent, severity: EventSeverity) {
        self.pool.events().emit(event, EventSource::Scheduler, severity);
    }

    fn emit_all(&self, events: PendingEvents) {
        for (event, severity) in events {
            self.emit(event, severity);
        }
    }
}

impl std::fmt::Debug for JobEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEngine")
            .field("in_flight", &self.in_flight())
            .field("max_concurrent_jobs", &self.config.max_concurrent_jobs)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
