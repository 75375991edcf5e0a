//! Job types for embedding requests
//!
//! A Job is one embedding request (fetch-and-render a target) tracked by
//! the scheduler from submission to a terminal state.

use std::collections::HashMap;

use crate::{BatchId, ConnectionId, Identity, InstanceId, JobId, ShardId};
use serde::{Deserialize, Serialize};

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in a priority bucket
    Queued,
    /// Owned by exactly one instance
    Processing,
    /// Finished successfully
    Completed,
    /// Finished after exhausting retries (or failing validation)
    Failed,
    /// Failed at least once and waiting in a lower bucket
    Retrying,
    /// Removed from the queue before dispatch
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued or re-queued after a failure.
    pub fn is_waiting(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retrying)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Caller options for an embedding request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedOptions {
    /// Scheduler-level retries; falls back to the scheduler default
    pub max_retries: Option<u32>,

    /// Per-attempt timeout override in milliseconds
    pub timeout_ms: Option<u64>,

    /// Free-form options forwarded to the renderer
    pub params: HashMap<String, String>,
}

impl EmbedOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A job descriptor as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub target: String,
    #[serde(default)]
    pub options: EmbedOptions,
}

impl JobSpec {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            options: EmbedOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EmbedOptions) -> Self {
        self.options = options;
        self
    }
}

impl From<&str> for JobSpec {
    fn from(target: &str) -> Self {
        JobSpec::new(target)
    }
}

impl From<String> for JobSpec {
    fn from(target: String) -> Self {
        JobSpec::new(target)
    }
}

/// Result of a successful embed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedOutput {
    /// Rendered content
    pub content: String,

    /// Metadata reported by the renderer
    pub metadata: HashMap<String, String>,

    /// Instance that produced the result
    pub instance_id: InstanceId,

    /// Identity used for the successful attempt
    pub identity: Identity,

    /// Total time spent inside the instance
    pub latency_ms: u64,

    /// Attempts made inside the instance (1 = first try succeeded)
    pub attempts: u32,
}

/// A job record as tracked by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub batch_id: BatchId,
    pub shard_id: Option<ShardId>,

    pub target: String,
    pub options: EmbedOptions,

    /// Current priority bucket (0 = highest)
    pub priority: u8,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Dispatches made so far
    pub attempts: u32,

    /// Instance owning the job while processing
    pub instance_id: Option<InstanceId>,
    pub connection_id: Option<ConnectionId>,

    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Error of the most recent failed attempt
    pub error: Option<String>,
    pub result: Option<EmbedOutput>,
}

impl Job {
    pub fn new(
        spec: JobSpec,
        batch_id: BatchId,
        shard_id: Option<ShardId>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: JobId::generate(),
            batch_id,
            shard_id,
            target: spec.target,
            options: spec.options,
            priority,
            status: JobStatus::Queued,
            retry_count: 0,
            max_retries,
            attempts: 0,
            instance_id: None,
            connection_id: None,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            result: None,
        }
    }

    pub fn processing_time_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }
}
