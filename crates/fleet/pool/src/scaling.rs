//! Auto-scaling decisions.

use serde::{Deserialize, Serialize};

use crate::config::AutoScaleConfig;

/// Decision made by the auto-scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalingDecision {
    /// No action needed.
    None,
    /// Add instances.
    ScaleUp { count: usize, reason: String },
    /// Remove the least-loaded instances.
    ScaleDown { count: usize, reason: String },
}

/// Observed load the auto-scaler decides on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingContext {
    pub total_instances: usize,
    pub ready_instances: usize,
    pub active_connections: usize,
    pub min_instances: usize,
    pub max_instances: usize,
    pub reference_load: usize,
}

impl ScalingContext {
    /// Average active connections per ready instance.
    pub fn average_load(&self) -> f64 {
        if self.ready_instances == 0 {
            0.0
        } else {
            self.active_connections as f64 / self.ready_instances as f64
        }
    }
}

impl AutoScaleConfig {
    pub fn evaluate(&self, context: &ScalingContext) -> ScalingDecision {
        let total = context.total_instances;

        if total < context.min_instances {
            return ScalingDecision::ScaleUp {
                count: (context.min_instances - total).min(context.max_instances.saturating_sub(total)),
                reason: format!("{} instances below floor {}", total, context.min_instances),
            };
        }
        // Nothing ready: replacement is the health monitor's job
        if context.ready_instances == 0 {
            return ScalingDecision::None;
        }

        let average = context.average_load();
        let reference = context.reference_load as f64;
        let high = self.scale_up_threshold * reference;
        let low = self.scale_down_threshold * reference;
        let step = self.step.max(1);

        if average > high && total < context.max_instances {
            ScalingDecision::ScaleUp {
                count: step.min(context.max_instances - total),
                reason: format!("average load {:.2} above {:.2}", average, high),
            }
        } else if average < low && total > context.min_instances {
            ScalingDecision::ScaleDown {
                count: step.min(total - context.min_instances),
                reason: format!("average load {:.2} below {:.2}", average, low),
            }
        } else {
            ScalingDecision::None
        }
    }
}
