//! Engine metrics and system status.

use fleet_pool::PoolStatus;
use serde::{Deserialize, Serialize};

/// Smoothing factor of the average processing time.
const PROCESSING_TIME_ALPHA: f64 = 0.1;

/// Counters maintained by the job engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub submitted: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    /// Jobs failed by the content validator
    pub rejected: u64,
    /// Exponential moving average of successful processing time
    pub avg_processing_ms: f64,
    /// completed / (completed + failed); zero until a job settles
    pub success_rate: f64,
}

impl EngineMetrics {
    pub(crate) fn record_success(&mut self, processing_ms: f64) {
        self.completed += 1;
        if self.completed == 1 {
            self.avg_processing_ms = processing_ms;
        } else {
            self.avg_processing_ms = PROCESSING_TIME_ALPHA * processing_ms
                + (1.0 - PROCESSING_TIME_ALPHA) * self.avg_processing_ms;
        }
        self.update_success_rate();
    }

    pub(crate) fn record_failure(&mut self) {
        self.failed += 1;
        self.update_success_rate();
    }

    fn update_success_rate(&mut self) {
        let settled = self.completed + self.failed;
        if settled > 0 {
            self.success_rate = self.completed as f64 / settled as f64;
        }
    }
}

/// Whole-system view: queues, engine metrics and the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Queue depth per priority bucket
    pub queue_depths: Vec<usize>,
    pub queued: usize,
    pub in_flight: usize,
    pub max_concurrent_jobs: usize,
    /// Job records currently held, terminal ones included
    pub tracked_jobs: usize,
    pub batches: usize,
    pub sessions: usize,
    pub metrics: EngineMetrics,
    pub pool: PoolStatus,
}
