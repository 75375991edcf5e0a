//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the job engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global ceiling on jobs in flight
    pub max_concurrent_jobs: usize,

    /// Dispatch loop period in milliseconds
    pub dispatch_interval_ms: u64,

    /// Most jobs started in one dispatch tick
    pub batch_size: usize,

    /// Default shard count of a massive submission
    pub shard_count: usize,

    /// Number of priority buckets (bucket 0 is served first)
    pub priority_levels: u8,

    /// Scheduler-level retries when neither job nor submission sets one
    pub default_max_retries: u32,

    /// Submissions up to this size may trigger an immediate dispatch
    pub nudge_max_jobs: usize,

    /// ...but only while fewer jobs than this are in flight
    pub nudge_in_flight_threshold: usize,

    /// How long completed (and cancelled) jobs stay queryable, in seconds
    pub success_retention_secs: u64,

    /// How long failed jobs stay queryable, in seconds
    pub failure_retention_secs: u64,

    /// Purge loop period in seconds (0 disables the loop)
    pub purge_interval_secs: u64,

    /// Live-session snapshot period in milliseconds (0 disables the loop)
    pub session_interval_ms: u64,

    /// Reject submissions that would queue more than this many jobs
    pub max_queued_jobs: Option<usize>,

    /// Create an instance when the pool has none ready
    pub auto_create_instances: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 256,
            dispatch_interval_ms: 10,
            batch_size: 100,
            shard_count: 10,
            priority_levels: 5,
            default_max_retries: 3,
            nudge_max_jobs: 10,
            nudge_in_flight_threshold: 50,
            success_retention_secs: 60,
            failure_retention_secs: 3600,
            purge_interval_secs: 5,
            session_interval_ms: 1000,
            max_queued_jobs: None,
            auto_create_instances: true,
        }
    }
}

impl SchedulerConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn success_retention(&self) -> Duration {
        Duration::from_secs(self.success_retention_secs)
    }

    pub fn failure_retention(&self) -> Duration {
        Duration::from_secs(self.failure_retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn session_interval(&self) -> Duration {
        Duration::from_millis(self.session_interval_ms)
    }

    /// Lowest-priority bucket index.
    pub fn lowest_priority(&self) -> u8 {
        self.priority_levels.saturating_sub(1)
    }
}
