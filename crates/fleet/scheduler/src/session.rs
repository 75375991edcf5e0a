//! Live-viewing sessions and real-time command fan-out.
//!
//! A session watches a set of jobs and receives periodic snapshots of them.
//! Commands addressed to a session reach every connection currently serving
//! one of its jobs.

use chrono::{DateTime, Utc};
use fleet_types::{
    BatchId, CommandReport, ConnectionId, InstanceId, JobId, JobStatus, SessionCommand,
    SessionId, SessionSnapshot,
};
use futures::future::join_all;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, instrument, warn};

use crate::engine::JobEngine;
use crate::error::{SchedulerError, SchedulerResult};

/// Snapshots buffered per session before new ones are dropped.
const SESSION_BUFFER: usize = 16;

#[derive(Debug)]
pub(crate) struct SessionRecord {
    pub jobs: Vec<JobId>,
    pub tx: mpsc::Sender<SessionSnapshot>,
    pub sequence: u64,
    pub opened_at: DateTime<Utc>,
}

impl JobEngine {
    /// Open a session watching `job_ids`.
    pub fn open_session(
        &self,
        job_ids: impl IntoIterator<Item = JobId>,
    ) -> (SessionId, mpsc::Receiver<SessionSnapshot>) {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        let session_id = SessionId::generate();
        let jobs: Vec<JobId> = job_ids.into_iter().collect();

        info!(session_id = %session_id, jobs = jobs.len(), "Session opened");
        self.sessions.insert(
            session_id,
            SessionRecord {
                jobs,
                tx,
                sequence: 0,
                opened_at: Utc::now(),
            },
        );
        (session_id, rx)
    }

    /// Open a session watching every job of a batch.
    pub fn open_batch_session(
        &self,
        batch_id: &BatchId,
    ) -> SchedulerResult<(SessionId, mpsc::Receiver<SessionSnapshot>)> {
        let jobs = self.batch_jobs(batch_id)?;
        Ok(self.open_session(jobs))
    }

    /// Add jobs to an open session.
    pub fn watch(
        &self,
        session_id: &SessionId,
        job_ids: impl IntoIterator<Item = JobId>,
    ) -> SchedulerResult<()> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or(SchedulerError::SessionNotFound(*session_id))?;
        for job_id in job_ids {
            if !record.jobs.contains(&job_id) {
                record.jobs.push(job_id);
            }
        }
        Ok(())
    }

    pub fn close_session(&self, session_id: &SessionId) -> bool {
        let closed = self.sessions.remove(session_id).is_some();
        if closed {
            info!(session_id = %session_id, "Session closed");
        }
        closed
    }

    /// Current view of a session's jobs, without delivering it.
    pub fn session_snapshot(&self, session_id: &SessionId) -> SchedulerResult<SessionSnapshot> {
        let (jobs, sequence) = self
            .sessions
            .get(session_id)
            .map(|record| (record.jobs.clone(), record.sequence))
            .ok_or(SchedulerError::SessionNotFound(*session_id))?;
        Ok(self.build_snapshot(*session_id, &jobs, sequence))
    }

    fn build_snapshot(
        &self,
        session_id: SessionId,
        job_ids: &[JobId],
        sequence: u64,
    ) -> SessionSnapshot {
        let state = self.lock_state();
        let mut jobs = Vec::with_capacity(job_ids.len());
        let mut missing = Vec::new();
        for job_id in job_ids {
            match state.jobs.get(job_id) {
                Some(job) => jobs.push(job.clone()),
                None => missing.push(*job_id),
            }
        }

        SessionSnapshot {
            session_id,
            sequence,
            taken_at: Utc::now(),
            jobs,
            missing,
        }
    }

    /// Deliver one snapshot to every session. Returns how many were sent.
    ///
    /// Unreadable jobs are listed as missing; a session with no readable
    /// job gets nothing this round. Sessions whose receiver is gone are
    /// closed.
    pub fn session_tick(&self) -> usize {
        let session_ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut delivered = 0;
        let mut gone = Vec::new();

        for session_id in session_ids {
            let Some(mut record) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let snapshot = self.build_snapshot(session_id, &record.jobs, record.sequence + 1);
            if snapshot.jobs.is_empty() {
                debug!(session_id = %session_id, missing = snapshot.missing.len(), "No readable job for session");
                continue;
            }

            match record.tx.try_send(snapshot) {
                Ok(()) => {
                    record.sequence += 1;
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    debug!(session_id = %session_id, "Session receiver lagging, snapshot dropped");
                }
                Err(TrySendError::Closed(_)) => gone.push(session_id),
            }
        }

        for session_id in gone {
            if let Some((_, record)) = self.sessions.remove(&session_id) {
                debug!(
                    session_id = %session_id,
                    open_secs = (Utc::now() - record.opened_at).num_seconds(),
                    "Session receiver dropped"
                );
            }
        }
        delivered
    }

    /// Send `command` to every connection serving one of the session's
    /// jobs, concurrently. One failed delivery does not stop the others.
    #[instrument(skip(self, command), fields(command = %command.name))]
    pub async fn send_command(
        &self,
        session_id: &SessionId,
        command: &SessionCommand,
    ) -> SchedulerResult<CommandReport> {
        let job_ids = self
            .sessions
            .get(session_id)
            .map(|record| record.jobs.clone())
            .ok_or(SchedulerError::SessionNotFound(*session_id))?;

        let targets: Vec<(JobId, InstanceId, ConnectionId)> = {
            let state = self.lock_state();
            job_ids
                .iter()
                .filter_map(|id| state.jobs.get(id))
                .filter(|job| job.status == JobStatus::Processing)
                .filter_map(|job| Some((job.id, job.instance_id?, job.connection_id?)))
                .collect()
        };

        let results = join_all(targets.iter().map(|(_, instance_id, connection_id)| {
            self.pool.send_command(instance_id, connection_id, command)
        }))
        .await;

        let mut report = CommandReport::default();
        for ((job_id, _, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Command delivery failed");
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", job_id, e));
                }
            }
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            "Command fanned out"
        );
        Ok(report)
    }
}
