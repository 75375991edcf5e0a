//! Rotation/failover controller.
//!
//! Each instance runs three independent timers: full identity rotation,
//! user-agent rotation and health checking. Timers hold only a weak
//! reference and stop on shutdown or when the instance is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::instance::{Instance, RotationOutcome};

pub(crate) fn spawn_timers(instance: &Arc<Instance>) -> Vec<JoinHandle<()>> {
    let config = instance.config();

    [
        spawn_timer(instance, "rotation", config.rotation_interval(), |instance| async move {
            if let RotationOutcome::Degraded { reason } = instance.rotate_if_due().await {
                warn!(instance_id = %instance.id(), reason = %reason, "Scheduled rotation degraded instance");
            }
        }),
        spawn_timer(
            instance,
            "user_agent_rotation",
            config.user_agent_rotation_interval(),
            |instance| async move {
                if let Err(e) = instance.rotate_user_agent().await {
                    warn!(instance_id = %instance.id(), error = %e, "User-agent rotation failed");
                }
            },
        ),
        spawn_timer(instance, "health", config.health_check_interval(), |instance| async move {
            instance.health_check();
        }),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Spawn a periodic task; a zero period disables it.
fn spawn_timer<F, Fut>(
    instance: &Arc<Instance>,
    name: &'static str,
    period: Duration,
    tick: F,
) -> Option<JoinHandle<()>>
where
    F: Fn(Arc<Instance>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        return None;
    }

    let weak: Weak<Instance> = Arc::downgrade(instance);
    let mut shutdown_rx = instance.shutdown_receiver();
    let instance_id = instance.id();

    Some(tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                // Also fires when the instance is dropped
                _ = shutdown_rx.changed() => break,
            }

            let Some(instance) = weak.upgrade() else {
                break;
            };
            tick(instance).await;
        }

        debug!(instance_id = %instance_id, timer = name, "Instance timer stopped");
    }))
}
