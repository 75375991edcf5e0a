//! Submission and reporting flow of fleetd

use std::path::Path;
use std::sync::Arc;

use fleet_instance::{EventEmitter, InstanceServices, Renderer, SchemeValidator};
use fleet_pool::InstancePool;
use fleet_scheduler::{JobEngine, SystemStatus};
use fleet_types::{BatchId, BatchStatus, JobSpec, JobStatus, ShardStatus};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::{FleetConfig, SubmitConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::simulation::LoggingMetricsSink;

/// Broadcast capacity of the daemon's event channel
const EVENT_CAPACITY: usize = 4096;

/// Final report printed once the batch settles.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch: BatchStatus,
    pub shards: Vec<ShardStatus>,
    pub system: SystemStatus,
}

/// Build the pool and the engine around `renderer`, with events mirrored
/// into the log.
pub fn build_engine(config: &FleetConfig, renderer: Arc<dyn Renderer>) -> Arc<JobEngine> {
    let events = EventEmitter::new(EVENT_CAPACITY).with_sink(Arc::new(LoggingMetricsSink));
    let services = InstanceServices::new(renderer).with_events(events);
    let pool = InstancePool::new(config.pool.clone(), services);
    JobEngine::with_validator(
        config.scheduler.clone(),
        pool,
        Arc::new(SchemeValidator::default()),
    )
}

/// Targets from the command line followed by those of `file`, one per
/// line. Blank lines and `#` comments are skipped.
pub fn read_targets(args: &[String], file: Option<&Path>) -> DaemonResult<Vec<JobSpec>> {
    let mut targets: Vec<String> = args.to_vec();
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)?;
        targets.extend(parse_targets(&contents));
    }

    if targets.is_empty() {
        return Err(DaemonError::NoTargets);
    }
    Ok(targets.into_iter().map(JobSpec::new).collect())
}

fn parse_targets(contents: &str) -> impl Iterator<Item = String> + '_ {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Submit `jobs`, follow the batch until it settles and report on it.
///
/// Lists longer than the massive threshold are sharded.
#[instrument(skip(engine, jobs, submit), fields(jobs = jobs.len()))]
pub async fn run_batch(
    engine: &Arc<JobEngine>,
    jobs: Vec<JobSpec>,
    submit: &SubmitConfig,
) -> DaemonResult<RunReport> {
    let batch_id = if jobs.len() > submit.massive_threshold {
        engine.submit_massive(jobs, None, submit.max_retries)?
    } else {
        engine.submit(jobs, submit.priority, submit.max_retries)?
    };
    info!(batch_id = %batch_id, "Batch submitted");

    let progress = follow_progress(engine, &batch_id)?;
    let outcome = engine.wait_for_batch(&batch_id, submit.wait_timeout()).await;
    progress.abort();
    let batch = outcome?;

    info!(
        batch_id = %batch_id,
        completed = batch.counts.completed,
        failed = batch.counts.failed,
        cancelled = batch.counts.cancelled,
        "Batch finished"
    );

    Ok(RunReport {
        shards: engine.shard_status(&batch_id)?,
        system: engine.system_status(),
        batch,
    })
}

/// Log batch progress from a live session until aborted.
fn follow_progress(engine: &Arc<JobEngine>, batch_id: &BatchId) -> DaemonResult<JoinHandle<()>> {
    let (session_id, mut rx) = engine.open_batch_session(batch_id)?;
    let engine = Arc::downgrade(engine);
    let batch_id = *batch_id;

    Ok(tokio::spawn(async move {
        while let Some(snapshot) = rx.recv().await {
            let settled = snapshot
                .jobs
                .iter()
                .filter(|job| job.status.is_terminal())
                .count();
            let processing = snapshot
                .jobs
                .iter()
                .filter(|job| job.status == JobStatus::Processing)
                .count();
            info!(
                batch_id = %batch_id,
                sequence = snapshot.sequence,
                settled,
                processing,
                total = snapshot.jobs.len() + snapshot.missing.len(),
                "Batch progress"
            );
            if settled == snapshot.jobs.len() {
                break;
            }
        }
        if let Some(engine) = engine.upgrade() {
            engine.close_session(&session_id);
        }
    }))
}
