//! Instance lifecycle: failover, health reversibility and shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_instance::{
    EmbedError, EventEmitter, FailingMetricsSink, IdentityError, IdentityPolicy, Instance,
    InstanceConfig, InstanceServices, ResourceSampler, RotationOutcome, StaticIdentityPolicy,
    StaticRenderer,
};
use fleet_types::{EmbedOptions, FleetEvent, Identity, InstanceId, InstanceState, ResourceUsage};

/// Delegates to the static policy but can take regions offline.
struct OutagePolicy {
    inner: StaticIdentityPolicy,
    down: Mutex<Vec<String>>,
}

impl OutagePolicy {
    fn new() -> Self {
        Self {
            inner: StaticIdentityPolicy::empty()
                .with_region("us-east", ["ua-east-1", "ua-east-2"], ["us-west", "eu-west"])
                .with_region("us-west", ["ua-west-1"], ["us-east"])
                .with_region("eu-west", ["ua-eu-1"], ["us-east"]),
            down: Mutex::new(Vec::new()),
        }
    }

    fn take_down(&self, region: &str) {
        self.down.lock().unwrap().push(region.to_string());
    }
}

#[async_trait]
impl IdentityPolicy for OutagePolicy {
    async fn generate(&self, region: &str) -> Result<Identity, IdentityError> {
        if self.down.lock().unwrap().iter().any(|r| r == region) {
            return Err(IdentityError::Unavailable {
                region: region.to_string(),
                reason: "exit pool exhausted".to_string(),
            });
        }
        self.inner.generate(region).await
    }

    async fn rotate_user_agent(&self, current: &Identity) -> Result<Identity, IdentityError> {
        self.inner.rotate_user_agent(current).await
    }

    fn neighbours(&self, region: &str) -> Vec<String> {
        self.inner.neighbours(region)
    }
}

/// Reports whatever memory figure the test sets.
struct FixedSampler {
    memory_mb: Mutex<f64>,
}

impl ResourceSampler for FixedSampler {
    fn sample(&self, _instance_id: &InstanceId, _active: usize) -> ResourceUsage {
        ResourceUsage {
            memory_mb: *self.memory_mb.lock().unwrap(),
            cpu_percent: 5.0,
        }
    }
}

/// Route logs through the test harness; `RUST_LOG` widens the filter.
fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

async fn instance_with(services: InstanceServices) -> Arc<Instance> {
    init_tracing();
    let instance = Instance::create(InstanceConfig::manual(), services)
        .await
        .unwrap();
    instance.initialize().unwrap();
    instance
}

#[tokio::test]
async fn test_rotation_failure_fails_over_to_nearest_region() {
    let policy = Arc::new(OutagePolicy::new());
    let instance = instance_with(
        InstanceServices::new(Arc::new(StaticRenderer::new())).with_identity_policy(policy.clone()),
    )
    .await;
    let pending = instance
        .begin_embed("https://example.com", EmbedOptions::default(), None)
        .unwrap();

    policy.take_down("us-east");
    let outcome = instance.rotate().await;

    assert_eq!(
        outcome,
        RotationOutcome::FailedOver {
            from: "us-east".to_string(),
            to: "us-west".to_string(),
            migrated: 1,
        }
    );
    assert_eq!(instance.identity().region, "us-west");
    assert_eq!(
        instance.connection(&pending.connection_id()).unwrap().identity.region,
        "us-west"
    );
    assert_eq!(instance.metrics().failovers, 1);
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_rotation_without_neighbours_degrades_instance() {
    let policy = Arc::new(OutagePolicy::new());
    let instance = instance_with(
        InstanceServices::new(Arc::new(StaticRenderer::new())).with_identity_policy(policy.clone()),
    )
    .await;

    policy.take_down("us-east");
    policy.take_down("us-west");
    policy.take_down("eu-west");

    let outcome = instance.rotate().await;
    assert!(matches!(outcome, RotationOutcome::Degraded { .. }));
    assert_eq!(instance.state(), InstanceState::Unhealthy);

    // stays unhealthy while no identity is usable
    let report = instance.health_check();
    assert!(!report.healthy);
    assert_eq!(instance.state(), InstanceState::Unhealthy);
}

#[tokio::test]
async fn test_health_is_reversible() {
    let sampler = Arc::new(FixedSampler {
        memory_mb: Mutex::new(100.0),
    });
    let instance = instance_with(
        InstanceServices::new(Arc::new(StaticRenderer::new())).with_sampler(sampler.clone()),
    )
    .await;

    assert!(instance.health_check().healthy);

    *sampler.memory_mb.lock().unwrap() = 4096.0;
    let report = instance.health_check();
    assert!(!report.healthy);
    assert!(report.reasons[0].contains("memory"));
    assert_eq!(instance.state(), InstanceState::Unhealthy);
    assert!(instance
        .embed("https://example.com", EmbedOptions::default())
        .await
        .is_err());

    *sampler.memory_mb.lock().unwrap() = 200.0;
    assert!(instance.health_check().healthy);
    assert_eq!(instance.state(), InstanceState::Ready);
}

#[tokio::test]
async fn test_connection_limit_marks_unhealthy() {
    let config = InstanceConfig {
        limits: fleet_types::ResourceLimits {
            max_connections: 2,
            ..Default::default()
        },
        ..InstanceConfig::manual()
    };
    let instance = Instance::create(config, InstanceServices::new(Arc::new(StaticRenderer::new())))
        .await
        .unwrap();
    instance.initialize().unwrap();

    let a = instance
        .begin_embed("https://a.example", EmbedOptions::default(), None)
        .unwrap();
    let _b = instance
        .begin_embed("https://b.example", EmbedOptions::default(), None)
        .unwrap();
    assert!(!instance.is_available());
    assert!(!instance.health_check().healthy);

    drop(a);
    assert!(instance.health_check().healthy);
    assert!(instance.is_available());
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_embed() {
    let instance = instance_with(InstanceServices::new(Arc::new(StaticRenderer::with_latency(
        Duration::from_secs(30),
    ))))
    .await;

    let running = {
        let instance = instance.clone();
        tokio::spawn(async move {
            instance
                .embed("https://slow.example", EmbedOptions::default())
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(instance.active_connections(), 1);

    instance.shutdown();

    let result = running.await.unwrap();
    assert_eq!(result.unwrap_err(), EmbedError::Cancelled);
    assert_eq!(instance.state(), InstanceState::Shutdown);
}

#[tokio::test]
async fn test_failing_sink_never_affects_embed() {
    let events = EventEmitter::default().with_sink(Arc::new(FailingMetricsSink));
    let mut rx = events.subscribe();
    let instance = instance_with(
        InstanceServices::new(Arc::new(StaticRenderer::new())).with_events(events),
    )
    .await;

    let output = instance
        .embed("https://example.com", EmbedOptions::default())
        .await
        .unwrap();
    assert_eq!(output.attempts, 1);

    let first = rx.recv().await.unwrap();
    assert!(matches!(
        first.event,
        FleetEvent::InstanceStateChanged {
            to: InstanceState::Ready,
            ..
        }
    ));
}

#[tokio::test]
async fn test_user_agent_rotation_keeps_region() {
    let instance = instance_with(InstanceServices::new(Arc::new(StaticRenderer::new()))).await;
    let before = instance.identity();

    instance.rotate_user_agent().await.unwrap();
    let after = instance.identity();

    assert_eq!(before.region, after.region);
    assert_eq!(before.endpoint, after.endpoint);
    assert_ne!(before.user_agent, after.user_agent);
}
