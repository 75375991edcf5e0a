//! Instance configuration.

use std::time::Duration;

use fleet_types::ResourceLimits;
use serde::{Deserialize, Serialize};

/// Configuration shared by every instance of a pool.
///
/// Interval fields set to `0` disable the corresponding timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Resource budget used for health classification
    pub limits: ResourceLimits,

    /// Full identity rotation interval in seconds
    pub rotation_interval_secs: u64,

    /// User-agent-only rotation interval in seconds
    pub user_agent_rotation_interval_secs: u64,

    /// Health check interval in seconds
    pub health_check_interval_secs: u64,

    /// Internal retries after the first failed attempt
    pub retry_attempts: u32,

    /// Pause between internal retries in milliseconds
    pub retry_delay_ms: u64,

    /// Per-attempt timeout in milliseconds
    pub embed_timeout_ms: u64,

    /// Smoothing factor of the rolling-average latency
    pub latency_smoothing: f64,

    /// Region new instances start in
    pub home_region: String,

    /// Number of recently embedded targets kept per instance
    pub recent_targets: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            rotation_interval_secs: 300,
            user_agent_rotation_interval_secs: 120,
            health_check_interval_secs: 30,
            retry_attempts: 2,
            retry_delay_ms: 100,
            embed_timeout_ms: 30_000,
            latency_smoothing: 0.1,
            home_region: "us-east".to_string(),
            recent_targets: 32,
        }
    }
}

impl InstanceConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn user_agent_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.user_agent_rotation_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    /// Config with every timer disabled and no internal retries.
    ///
    /// Useful when a test drives rotation and health checks by hand.
    pub fn manual() -> Self {
        Self {
            rotation_interval_secs: 0,
            user_agent_rotation_interval_secs: 0,
            health_check_interval_secs: 0,
            retry_attempts: 0,
            retry_delay_ms: 0,
            ..Self::default()
        }
    }
}
