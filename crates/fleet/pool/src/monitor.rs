//! Pool health monitor.
//!
//! Aggregates per-instance metrics into pool-wide figures and gives each
//! unhealthy instance a bounded recovery window before replacing it.

use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use fleet_instance::Instance;
use fleet_types::{EventSeverity, FleetEvent, InstanceId, InstanceState};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::pool::InstancePool;

/// Pool-wide metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_instances: usize,
    pub ready_instances: usize,
    pub unhealthy_instances: usize,
    pub active_connections: usize,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Requests per second since the previous monitor tick
    pub throughput: f64,
    pub memory_mb: f64,
    /// Mean rolling-average latency of ready instances
    pub avg_latency_ms: f64,
    /// Instances currently inside their recovery window
    pub recovering: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstancePool {
    pub(crate) fn aggregate(&self, instances: &[Arc<Instance>]) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            total_instances: instances.len(),
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        let mut latency_sum = 0.0;

        for instance in instances {
            let m = instance.metrics();
            match instance.state() {
                InstanceState::Ready => {
                    metrics.ready_instances += 1;
                    latency_sum += m.avg_latency_ms;
                }
                InstanceState::Unhealthy => metrics.unhealthy_instances += 1,
                _ => {}
            }
            metrics.active_connections += instance.active_connections();
            metrics.total_requests += m.requests;
            metrics.total_successes += m.successes;
            metrics.total_failures += m.failures;
            metrics.memory_mb += m.usage.memory_mb;
        }

        if metrics.ready_instances > 0 {
            metrics.avg_latency_ms = latency_sum / metrics.ready_instances as f64;
        }
        metrics.recovering = self.recovery.len();
        metrics.throughput = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .throughput;
        metrics
    }

    /// Last metrics computed by the health monitor.
    pub fn metrics(&self) -> PoolMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One pass of the health monitor.
    ///
    /// Unhealthy instances whose recovery window elapsed are removed and,
    /// when auto-scaling is enabled, replaced.
    #[instrument(skip(self))]
    pub async fn health_monitor_tick(&self) -> PoolMetrics {
        let instances = self.instances();
        let now = Instant::now();
        let window = self.config.recovery_window();
        let mut expired: Vec<InstanceId> = Vec::new();

        for instance in &instances {
            let id = instance.id();
            if instance.state() == InstanceState::Unhealthy {
                let since = *self.recovery.entry(id).or_insert_with(|| {
                    info!(instance_id = %id, window_secs = window.as_secs(), "Recovery window started");
                    now
                });
                if now.duration_since(since) >= window {
                    expired.push(id);
                }
            } else if self.recovery.remove(&id).is_some() {
                info!(instance_id = %id, state = %instance.state(), "Instance left recovery window");
            }
        }

        for id in expired {
            warn!(instance_id = %id, "Instance did not recover in time");
            if !self.retire(&id, "recovery window expired") {
                continue;
            }
            if self.config.auto_scale.enabled {
                match self.create_instance().await {
                    Ok(replacement) => self.emit(
                        FleetEvent::InstanceReplaced {
                            removed: id,
                            replacement,
                        },
                        EventSeverity::Info,
                    ),
                    Err(e) => warn!(instance_id = %id, error = %e, "Replacement creation failed"),
                }
            }
        }

        let mut metrics = self.aggregate(&self.instances());
        {
            let mut last = self
                .last_sample
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some((at, requests)) = *last {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    metrics.throughput =
                        metrics.total_requests.saturating_sub(requests) as f64 / secs;
                }
            }
            *last = Some((now, metrics.total_requests));
        }

        *self.metrics.write().unwrap_or_else(PoisonError::into_inner) = metrics.clone();
        metrics
    }
}
