//! Resource usage sampling for health classification.

use fleet_types::{InstanceId, ResourceUsage};

/// Supplies memory and CPU figures to the health check.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self, instance_id: &InstanceId, active_connections: usize) -> ResourceUsage;
}

/// Estimates usage from the number of active connections.
#[derive(Debug, Clone)]
pub struct ConnectionLoadSampler {
    /// Baseline memory of an idle instance
    pub base_memory_mb: f64,
    pub memory_per_connection_mb: f64,
    pub base_cpu_percent: f64,
    pub cpu_per_connection_percent: f64,
}

impl Default for ConnectionLoadSampler {
    fn default() -> Self {
        Self {
            base_memory_mb: 128.0,
            memory_per_connection_mb: 12.0,
            base_cpu_percent: 2.0,
            cpu_per_connection_percent: 1.5,
        }
    }
}

impl ResourceSampler for ConnectionLoadSampler {
    fn sample(&self, _instance_id: &InstanceId, active_connections: usize) -> ResourceUsage {
        let active = active_connections as f64;
        ResourceUsage {
            memory_mb: self.base_memory_mb + active * self.memory_per_connection_mb,
            cpu_percent: (self.base_cpu_percent + active * self.cpu_per_connection_percent)
                .min(100.0),
        }
    }
}
