//! Pool configuration.

use std::time::Duration;

use fleet_instance::InstanceConfig;
use serde::{Deserialize, Serialize};

use crate::selection::SelectionStrategy;

/// Configuration for the instance pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on instances in any state
    pub max_instances: usize,

    /// Instances created when the pool starts
    pub instances_per_node: usize,

    /// The auto-scaler never goes below this many instances
    pub min_instances: usize,

    /// Health monitor interval in seconds (0 disables the loop)
    pub health_monitor_interval_secs: u64,

    /// How long an unhealthy instance may recover before removal, in seconds
    pub recovery_window_secs: u64,

    /// Default grace period for `shutdown`, in seconds
    pub shutdown_grace_secs: u64,

    /// Strategy used when the caller does not pick one
    pub strategy: SelectionStrategy,

    /// Auto-scaler settings
    pub auto_scale: AutoScaleConfig,

    /// Settings applied to every instance the pool creates
    pub instance: InstanceConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 16,
            instances_per_node: 2,
            min_instances: 1,
            health_monitor_interval_secs: 10,
            recovery_window_secs: 60,
            shutdown_grace_secs: 30,
            strategy: SelectionStrategy::LeastConnections,
            auto_scale: AutoScaleConfig::default(),
            instance: InstanceConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn health_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.health_monitor_interval_secs)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_secs(self.recovery_window_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Load against which the auto-scale thresholds are measured.
    pub fn reference_load(&self) -> usize {
        self.auto_scale
            .reference_load
            .unwrap_or(self.instance.limits.max_connections)
    }
}

/// Auto-scaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScaleConfig {
    pub enabled: bool,

    /// Evaluation interval in seconds (0 disables the loop)
    pub interval_secs: u64,

    /// Scale up above this fraction of the reference load
    pub scale_up_threshold: f64,

    /// Scale down below this fraction of the reference load
    pub scale_down_threshold: f64,

    /// Instances added or removed per decision
    pub step: usize,

    /// Per-instance reference load; defaults to the instance connection limit
    pub reference_load: Option<usize>,
}

impl Default for AutoScaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.2,
            step: 1,
            reference_load: None,
        }
    }
}

impl AutoScaleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
