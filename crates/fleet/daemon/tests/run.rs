//! End-to-end runs of the daemon flow against in-process renderers.

use std::sync::Arc;

use fleet_daemon::{build_engine, run_batch, FleetConfig, SimulatedRenderer, SimulationConfig};
use fleet_instance::StaticRenderer;
use fleet_types::{JobSpec, ShardState};

fn small_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.pool.instances_per_node = 2;
    config.pool.auto_scale.enabled = false;
    config.scheduler.dispatch_interval_ms = 1;
    config.scheduler.session_interval_ms = 5;
    config.submit.wait_timeout_secs = 30;
    config
}

fn targets(n: usize) -> Vec<JobSpec> {
    (0..n)
        .map(|i| JobSpec::new(format!("https://site.example/{}", i)))
        .collect()
}

#[tokio::test]
async fn test_regular_submission_reports_status() {
    let config = small_config();
    let engine = build_engine(&config, Arc::new(StaticRenderer::new()));
    engine.start().await.unwrap();

    let mut jobs = targets(5);
    jobs.push(JobSpec::new("ftp://files.example/blob"));

    let report = run_batch(&engine, jobs, &config.submit).await.unwrap();
    assert!(report.batch.finished);
    assert_eq!(report.batch.total, 6);
    assert_eq!(report.batch.counts.completed, 5);
    // rejected by the scheme check
    assert_eq!(report.batch.counts.failed, 1);
    assert!(report.shards.is_empty());
    assert_eq!(report.system.in_flight, 0);
    assert_eq!(report.system.metrics.rejected, 1);

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["system"]["pool"].is_object());

    engine.shutdown(config.pool.shutdown_grace()).await;
}

#[tokio::test]
async fn test_large_list_is_sharded() {
    let mut config = small_config();
    config.submit.massive_threshold = 10;
    config.scheduler.shard_count = 4;
    let engine = build_engine(
        &config,
        Arc::new(SimulatedRenderer::new(&SimulationConfig {
            min_latency_ms: 0,
            max_latency_ms: 2,
            failure_rate: 0.0,
        })),
    );
    engine.start().await.unwrap();

    let report = run_batch(&engine, targets(40), &config.submit)
        .await
        .unwrap();
    assert_eq!(report.batch.shard_count, 4);
    assert_eq!(report.batch.counts.completed, 40);
    assert_eq!(report.shards.len(), 4);
    assert!(report
        .shards
        .iter()
        .all(|shard| shard.total == 10 && shard.state == ShardState::Completed));

    engine.shutdown(config.pool.shutdown_grace()).await;
}
