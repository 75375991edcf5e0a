//! Instance types for individual proxy instances
//!
//! A proxy instance is one stateful worker identity owned by the pool.

use crate::{Identity, InstanceId, JobId};
use serde::{Deserialize, Serialize};

/// Instance lifecycle state
///
/// ```text
/// initializing -> ready <-> unhealthy
/// ready | unhealthy -> shutting_down -> shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Instance is being set up
    Initializing,
    /// Instance accepts work
    Ready,
    /// Instance failed a health check; not eligible for work
    Unhealthy,
    /// Instance is draining its connections
    ShuttingDown,
    /// Instance is gone (terminal)
    Shutdown,
}

impl InstanceState {
    /// Whether the FSM allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Initializing, ShuttingDown)
                | (Ready, Unhealthy)
                | (Unhealthy, Ready)
                | (Ready, ShuttingDown)
                | (Unhealthy, ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }

    /// Only ready instances may receive jobs.
    pub fn is_eligible(self) -> bool {
        matches!(self, InstanceState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Shutdown)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Initializing => "initializing",
            InstanceState::Ready => "ready",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::ShuttingDown => "shutting_down",
            InstanceState::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Resource budget of an instance.
///
/// Used only to classify health; nothing is enforced at the OS level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum concurrent connections
    pub max_connections: usize,

    /// Memory budget in megabytes
    pub max_memory_mb: f64,

    /// CPU budget in percent
    pub max_cpu_percent: f64,

    /// Rolling-average response time budget in milliseconds
    pub max_response_time_ms: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_memory_mb: 1024.0,
            max_cpu_percent: 90.0,
            max_response_time_ms: 10_000.0,
        }
    }
}

/// Sampled resource usage of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Instance metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetrics {
    /// Fetch attempts issued
    pub requests: u64,

    /// Successful attempts
    pub successes: u64,

    /// Failed attempts
    pub failures: u64,

    /// Rolling-average latency in milliseconds (exponential smoothing)
    pub avg_latency_ms: f64,

    /// Last time the instance did any work
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,

    /// Identity rotations performed
    pub rotations: u64,

    /// Failovers to a neighbouring region
    pub failovers: u64,

    /// Last sampled resource usage
    pub usage: ResourceUsage,
}

impl InstanceMetrics {
    /// Fold a new latency sample into the rolling average.
    ///
    /// The first sample seeds the average.
    pub fn record_latency(&mut self, latency_ms: f64, alpha: f64) {
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms = alpha * latency_ms + (1.0 - alpha) * self.avg_latency_ms;
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Metadata of one in-flight connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Target being fetched
    pub target: String,

    /// Job this connection serves, if dispatched by the scheduler
    pub job_id: Option<JobId>,

    /// When the connection was opened
    pub started_at: chrono::DateTime<chrono::Utc>,

    /// Internal retry attempt currently running
    pub retry_count: u32,

    /// Identity the connection currently uses
    pub identity: Identity,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub state: InstanceState,
    pub identity: Identity,
    pub active_connections: usize,
    pub limits: ResourceLimits,
    pub metrics: InstanceMetrics,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Most recently embedded targets, newest last
    pub recent_targets: Vec<String>,
}
