//! Dispatch ordering, retries, massive submissions and engine lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain, engine, engine_config, eventually, pool_config, targets, GatedRenderer, WAIT};
use fleet_instance::{FailingRenderer, InstanceServices, SchemeValidator, StaticRenderer};
use fleet_pool::{InstancePool, ScalingDecision};
use fleet_scheduler::{JobEngine, SchedulerConfig, SchedulerError};
use fleet_types::{FleetEvent, JobId, JobSpec, JobStatus, ShardState};

#[tokio::test]
async fn test_higher_priority_bucket_drains_first() {
    let engine = engine(
        SchedulerConfig {
            max_concurrent_jobs: 1,
            ..engine_config()
        },
        pool_config(1, 10),
        Arc::new(StaticRenderer::new()),
    );
    let mut events = engine.subscribe();

    // low-priority batch submitted first
    let low = engine.submit(targets("low", 1), 1, None).unwrap();
    let high = engine.submit(targets("high", 3), 0, None).unwrap();
    engine.start().await.unwrap();

    engine.wait_for_batch(&high, WAIT).await.unwrap();
    engine.wait_for_batch(&low, WAIT).await.unwrap();

    let dispatched: Vec<JobId> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            FleetEvent::JobDispatched { job_id, .. } => Some(job_id),
            _ => None,
        })
        .collect();
    assert_eq!(dispatched.len(), 4);

    let low_job = engine.batch_jobs(&low).unwrap()[0];
    assert_eq!(dispatched[3], low_job);
    for job_id in &dispatched[..3] {
        assert_eq!(engine.job_status(job_id).unwrap().priority, 0);
    }
}

#[tokio::test]
async fn test_retries_exhaust_after_max_retries_plus_one_attempts() {
    let renderer = Arc::new(FailingRenderer::new("connection reset"));
    let engine = engine(engine_config(), pool_config(1, 10), renderer.clone());
    let mut events = engine.subscribe();

    let batch = engine
        .submit(vec![JobSpec::new("https://flaky.example")], 0, Some(2))
        .unwrap();
    engine.start().await.unwrap();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();
    assert_eq!(status.counts.failed, 1);

    let job_id = engine.batch_jobs(&batch).unwrap()[0];
    let job = engine.job_status(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.retry_count, 2);
    // demoted one bucket per retry
    assert_eq!(job.priority, 2);
    assert!(job
        .error
        .as_deref()
        .unwrap()
        .starts_with("retries exhausted after 3 attempts"));

    // no fourth attempt, even later
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(renderer.calls(), 3);

    let retries: Vec<(u32, u8)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            FleetEvent::JobRetrying {
                retry_count,
                priority,
                ..
            } => Some((retry_count, priority)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, 1), (2, 2)]);

    let metrics = engine.metrics();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.retried, 2);
    assert_eq!(metrics.dispatched, 3);
}

#[tokio::test]
async fn test_massive_submission_shards_and_settles() {
    let engine = engine(
        engine_config(),
        pool_config(4, 50),
        Arc::new(StaticRenderer::new()),
    );

    let batch = engine
        .submit_massive(targets("bulk", 10_000), Some(10), None)
        .unwrap();

    let shards = engine.shard_status(&batch).unwrap();
    assert_eq!(shards.len(), 10);
    for (index, shard) in shards.iter().enumerate() {
        assert_eq!(shard.shard_id.index as usize, index);
        assert_eq!(shard.offset, index * 1000);
        assert_eq!(shard.total, 1000);
        assert_eq!(shard.state, ShardState::Pending);
    }
    assert_eq!(engine.system_status().queue_depths[1], 10_000);

    engine.start().await.unwrap();
    let status = engine
        .wait_for_batch(&batch, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(status.total, 10_000);
    assert_eq!(status.counts.completed + status.counts.failed, 10_000);
    assert_eq!(status.percent_complete, 100.0);
    assert_eq!(status.shard_count, 10);

    let shards = engine.shard_status(&batch).unwrap();
    assert!(shards.iter().all(|s| s.state == ShardState::Completed));
    assert!(shards.iter().all(|s| s.counts.completed == 1000));
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test]
async fn test_validator_rejects_without_retry() {
    let pool = InstancePool::new(
        pool_config(1, 10),
        InstanceServices::new(Arc::new(StaticRenderer::new())),
    );
    let engine = JobEngine::with_validator(engine_config(), pool, Arc::new(SchemeValidator::default()));

    let batch = engine
        .submit(
            vec![
                JobSpec::new("ftp://files.example/a"),
                JobSpec::new("https://ok.example"),
            ],
            0,
            Some(3),
        )
        .unwrap();
    engine.start().await.unwrap();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.counts.failed, 1);

    let rejected = engine.job_status(&engine.batch_jobs(&batch).unwrap()[0]).unwrap();
    assert_eq!(rejected.status, JobStatus::Failed);
    assert_eq!(rejected.attempts, 0);
    assert_eq!(rejected.retry_count, 0);
    assert!(rejected.error.unwrap().starts_with("validation failed"));
    assert_eq!(engine.metrics().rejected, 1);
}

#[tokio::test]
async fn test_cancellation() {
    let renderer = Arc::new(GatedRenderer::new());
    let engine = engine(
        SchedulerConfig {
            max_concurrent_jobs: 1,
            ..engine_config()
        },
        pool_config(1, 10),
        renderer.clone(),
    );
    engine.pool().start().await.unwrap();

    let batch = engine.submit(targets("cancel", 3), 0, None).unwrap();
    let jobs = engine.batch_jobs(&batch).unwrap();

    // first job goes to the instance and blocks there
    assert_eq!(engine.dispatch_tick().await, 1);
    let err = engine.cancel_job(&jobs[0]).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::NotCancellable {
            status: JobStatus::Processing,
            ..
        }
    ));

    engine.cancel_job(&jobs[1]).unwrap();
    engine.cancel_job(&jobs[1]).unwrap();
    assert_eq!(engine.job_status(&jobs[1]).unwrap().status, JobStatus::Cancelled);

    assert_eq!(engine.cancel_batch(&batch).unwrap(), 1);
    assert_eq!(engine.system_status().queued, 0);

    renderer.release_all();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();
    assert!(status.finished);
    assert_eq!(status.counts.completed, 1);
    assert_eq!(status.counts.cancelled, 2);
    // cancelled work does not count towards completion
    assert!((status.percent_complete - 100.0 / 3.0).abs() < 1e-9);

    assert!(matches!(
        engine.cancel_job(&jobs[0]),
        Err(SchedulerError::NotCancellable {
            status: JobStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_submission_checks() {
    let engine = engine(
        SchedulerConfig {
            max_queued_jobs: Some(5),
            ..engine_config()
        },
        pool_config(1, 10),
        Arc::new(StaticRenderer::new()),
    );

    assert!(matches!(
        engine.submit(targets("p", 1), 5, None),
        Err(SchedulerError::InvalidPriority {
            priority: 5,
            levels: 5
        })
    ));

    engine.submit(targets("a", 4), 0, None).unwrap();
    assert!(matches!(
        engine.submit(targets("b", 2), 0, None),
        Err(SchedulerError::QueueFull {
            queued: 4,
            requested: 2,
            limit: 5
        })
    ));
    engine.submit_massive(targets("c", 1), None, None).unwrap();

    let err = engine.job_status(&JobId::generate()).unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_empty_pool_gets_an_instance() {
    let engine = engine(
        engine_config(),
        pool_config(0, 10),
        Arc::new(StaticRenderer::new()),
    );
    engine.start().await.unwrap();
    assert_eq!(engine.pool().size(), 0);

    let batch = engine.submit(targets("auto", 2), 0, None).unwrap();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();

    assert_eq!(status.counts.completed, 2);
    assert_eq!(engine.pool().size(), 1);
}

#[tokio::test]
async fn test_shutdown_requeues_interrupted_jobs() {
    let renderer = Arc::new(GatedRenderer::new());
    let engine = engine(engine_config(), pool_config(1, 10), renderer);
    engine.start().await.unwrap();

    let batch = engine.submit(targets("stuck", 2), 0, None).unwrap();
    assert!(eventually(|| engine.in_flight() == 2).await);

    engine.shutdown(Duration::from_millis(20)).await;
    assert!(eventually(|| engine.in_flight() == 0).await);

    for job_id in engine.batch_jobs(&batch).unwrap() {
        let job = engine.job_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
    }
    assert!(matches!(
        engine.submit(targets("late", 1), 0, None),
        Err(SchedulerError::ShuttingDown)
    ));
    assert_eq!(engine.pool().size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_jobs_are_purged_after_retention() {
    let engine = engine(
        SchedulerConfig {
            success_retention_secs: 60,
            failure_retention_secs: 3600,
            ..engine_config()
        },
        pool_config(1, 10),
        Arc::new(FailingRenderer::new("down")),
    );
    engine.pool().start().await.unwrap();

    let failing = engine.submit(targets("fail", 1), 0, Some(0)).unwrap();
    engine.dispatch_tick().await;
    engine.wait_for_batch(&failing, WAIT).await.unwrap();
    let failed_job = engine.batch_jobs(&failing).unwrap()[0];

    let cancelled = engine.submit(targets("cancel", 1), 0, None).unwrap();
    engine.cancel_batch(&cancelled).unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(engine.purge_tick(), 1);
    assert!(engine.batch_status(&cancelled).unwrap_err().is_not_found());
    assert_eq!(
        engine.job_status(&failed_job).unwrap().status,
        JobStatus::Failed
    );

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(engine.purge_tick(), 1);
    assert!(engine.job_status(&failed_job).unwrap_err().is_not_found());
    assert!(engine.batch_status(&failing).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_scale_down_requeues_instead_of_failing() {
    let renderer = Arc::new(GatedRenderer::new());
    let mut pool = pool_config(2, 10);
    pool.auto_scale.enabled = true;
    pool.auto_scale.interval_secs = 0;
    let engine = engine(engine_config(), pool, renderer.clone());
    engine.start().await.unwrap();
    assert_eq!(engine.pool().size(), 2);

    // no retries to spare
    let batch = engine.submit(targets("scale", 2), 0, Some(0)).unwrap();
    assert!(eventually(|| engine.in_flight() == 2).await);

    let decision = engine.pool().autoscale_tick().await;
    assert!(matches!(decision, ScalingDecision::ScaleDown { count: 1, .. }));
    assert_eq!(engine.pool().size(), 1);

    renderer.release_all();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();
    assert_eq!(status.counts.completed, 2);
    assert_eq!(status.counts.failed, 0);
    for job_id in engine.batch_jobs(&batch).unwrap() {
        let job = engine.job_status(&job_id).unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.priority, 0);
    }
    assert_eq!(engine.metrics().retried, 0);
}

#[tokio::test]
async fn test_small_submission_dispatches_without_waiting_for_tick() {
    let engine = engine(
        SchedulerConfig {
            dispatch_interval_ms: 60_000,
            nudge_max_jobs: 3,
            ..engine_config()
        },
        pool_config(1, 10),
        Arc::new(StaticRenderer::new()),
    );
    engine.start().await.unwrap();
    // let the loop's immediate first tick pass
    tokio::time::sleep(Duration::from_millis(50)).await;

    let small = engine.submit(targets("small", 3), 0, None).unwrap();
    let status = engine
        .wait_for_batch(&small, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.counts.completed, 3);

    // too large to nudge, waits for the next tick
    let large = engine.submit(targets("large", 4), 0, None).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(engine.batch_status(&large).unwrap().counts.queued, 4);
    assert_eq!(engine.system_status().queued, 4);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch_is_purged() {
    let engine = engine(
        SchedulerConfig {
            success_retention_secs: 60,
            ..engine_config()
        },
        pool_config(1, 10),
        Arc::new(StaticRenderer::new()),
    );

    let batch = engine.submit(Vec::new(), 0, None).unwrap();
    let status = engine.wait_for_batch(&batch, WAIT).await.unwrap();
    assert!(status.finished);
    assert_eq!(status.total, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    engine.purge_tick();
    assert!(engine.batch_status(&batch).unwrap_err().is_not_found());
    assert_eq!(engine.system_status().batches, 0);
}
