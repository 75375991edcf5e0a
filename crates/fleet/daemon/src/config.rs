//! Configuration for fleetd

use std::time::Duration;

use fleet_pool::PoolConfig;
use fleet_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Instance pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Job engine configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Submission behaviour of the CLI
    #[serde(default)]
    pub submit: SubmitConfig,

    /// Simulated renderer configuration
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the daemon submits its target list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConfig {
    /// Lists longer than this go through massive (sharded) submission
    #[serde(default = "default_massive_threshold")]
    pub massive_threshold: usize,

    /// Priority bucket of a regular submission
    #[serde(default)]
    pub priority: u8,

    /// Retries per job; the engine default applies when unset
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Give up waiting for the batch after this many seconds
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            massive_threshold: default_massive_threshold(),
            priority: 0,
            max_retries: None,
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl SubmitConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Simulated renderer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Lower bound of the simulated fetch latency in milliseconds
    #[serde(default = "default_min_latency")]
    pub min_latency_ms: u64,

    /// Upper bound of the simulated fetch latency in milliseconds
    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,

    /// Probability in [0, 1] that a fetch fails
    #[serde(default)]
    pub failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: default_min_latency(),
            max_latency_ms: default_max_latency(),
            failure_rate: 0.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_massive_threshold() -> usize {
    1000
}

fn default_wait_timeout() -> u64 {
    600
}

fn default_min_latency() -> u64 {
    20
}

fn default_max_latency() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FleetConfig {
    /// Load configuration: defaults, then the optional file, then `FLEET_`
    /// environment variables (`FLEET_SCHEDULER__SHARD_COUNT=20`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&FleetConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.pool.max_instances, 16);
        assert_eq!(config.scheduler.shard_count, 10);
        assert_eq!(config.submit.massive_threshold, 1000);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_simulation_defaults() {
        let config = SimulationConfig::default();
        assert!(config.min_latency_ms <= config.max_latency_ms);
        assert_eq!(config.failure_rate, 0.0);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: FleetConfig =
            serde_json::from_str(r#"{"scheduler": {"shard_count": 4}, "submit": {"priority": 2}}"#)
                .unwrap();
        assert_eq!(config.scheduler.shard_count, 4);
        assert_eq!(config.scheduler.priority_levels, 5);
        assert_eq!(config.submit.priority, 2);
        assert_eq!(config.submit.wait_timeout(), Duration::from_secs(600));
    }
}
