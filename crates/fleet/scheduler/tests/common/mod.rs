//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_instance::{
    InstanceConfig, InstanceServices, RenderError, RenderRequest, RenderedPage, Renderer,
};
use fleet_pool::{AutoScaleConfig, InstancePool, PoolConfig};
use fleet_scheduler::{JobEngine, SchedulerConfig};
use fleet_types::{ConnectionInfo, FleetEvent, FleetEventEnvelope, JobSpec, SessionCommand};
use tokio::sync::{broadcast, Semaphore};

pub const WAIT: Duration = Duration::from_secs(30);

/// Holds every fetch until released. Commands fail for targets containing
/// "reject".
pub struct GatedRenderer {
    gate: Semaphore,
    commands: AtomicUsize,
}

impl GatedRenderer {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            commands: AtomicUsize::new(0),
        }
    }

    pub fn release_all(&self) {
        self.gate.add_permits(100_000);
    }

    pub fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for GatedRenderer {
    async fn fetch(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| RenderError::Fetch(e.to_string()))?;
        Ok(RenderedPage {
            content: request.target.clone(),
            ..Default::default()
        })
    }

    async fn execute_command(
        &self,
        connection: &ConnectionInfo,
        command: &SessionCommand,
    ) -> Result<(), RenderError> {
        if connection.target.contains("reject") {
            return Err(RenderError::Unsupported(command.name.clone()));
        }
        self.commands.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Pool of `instances` manual-timer instances, auto-scaling off.
pub fn pool_config(instances: usize, max_connections: usize) -> PoolConfig {
    let mut instance = InstanceConfig::manual();
    instance.limits.max_connections = max_connections;
    PoolConfig {
        max_instances: instances.max(1),
        instances_per_node: instances,
        min_instances: instances.min(1),
        health_monitor_interval_secs: 0,
        auto_scale: AutoScaleConfig {
            enabled: false,
            ..Default::default()
        },
        instance,
        ..Default::default()
    }
}

/// Fast dispatch; purge and session loops off so tests drive them.
pub fn engine_config() -> SchedulerConfig {
    SchedulerConfig {
        dispatch_interval_ms: 1,
        purge_interval_secs: 0,
        session_interval_ms: 0,
        ..Default::default()
    }
}

/// Route logs through the test harness; `RUST_LOG` widens the filter.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn engine(
    config: SchedulerConfig,
    pool_config: PoolConfig,
    renderer: Arc<dyn Renderer>,
) -> Arc<JobEngine> {
    init_tracing();
    let pool = InstancePool::new(pool_config, InstanceServices::new(renderer));
    JobEngine::new(config, pool)
}

pub fn targets(prefix: &str, n: usize) -> Vec<JobSpec> {
    (0..n)
        .map(|i| JobSpec::new(format!("https://{}.example/{}", prefix, i)))
        .collect()
}

/// Every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<FleetEventEnvelope>) -> Vec<FleetEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(envelope) => events.push(envelope.event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
