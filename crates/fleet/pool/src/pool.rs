//! The instance pool.
//!
//! The pool owns the instance set. Callers ask it for "the best instance for
//! this job" and never touch instances' internals directly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use fleet_instance::{EventEmitter, Instance, InstanceConfig, InstanceServices, PendingEmbed};
use fleet_types::{
    ConnectionId, EmbedOptions, EmbedOutput, EventSeverity, EventSource, FleetEvent,
    FleetEventEnvelope, InstanceId, InstanceSnapshot, JobId, SessionCommand,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::monitor::PoolMetrics;
use crate::scaling::{ScalingContext, ScalingDecision};
use crate::selection::{self, SelectionStrategy};

/// Per-instance and aggregate view of the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub instances: Vec<InstanceSnapshot>,
    pub metrics: PoolMetrics,
    pub max_instances: usize,
    pub min_instances: usize,
    pub auto_scale: bool,
    pub strategy: SelectionStrategy,
}

/// Owns and load-balances the proxy instances.
pub struct InstancePool {
    pub(crate) config: PoolConfig,
    services: InstanceServices,
    /// Ordered by creation; selection ties go to the oldest
    instances: RwLock<Vec<Arc<Instance>>>,
    creating: tokio::sync::Mutex<()>,
    request_counter: AtomicU64,
    /// When each currently unhealthy instance was first seen unhealthy
    pub(crate) recovery: DashMap<InstanceId, Instant>,
    pub(crate) metrics: RwLock<PoolMetrics>,
    pub(crate) last_sample: Mutex<Option<(Instant, u64)>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InstancePool {
    pub fn new(config: PoolConfig, services: InstanceServices) -> Arc<Self> {
        Arc::new(Self {
            config,
            services,
            instances: RwLock::new(Vec::new()),
            creating: tokio::sync::Mutex::new(()),
            request_counter: AtomicU64::new(0),
            recovery: DashMap::new(),
            metrics: RwLock::new(PoolMetrics::default()),
            last_sample: Mutex::new(None),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Create the initial instances and start the health monitor and
    /// auto-scaler loops.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> PoolResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let initial = self
            .config
            .instances_per_node
            .max(self.config.min_instances)
            .min(self.config.max_instances);
        for _ in 0..initial {
            self.create_instance().await?;
        }

        let mut tasks = Vec::new();
        tasks.extend(self.spawn_loop(
            "health_monitor",
            self.config.health_monitor_interval(),
            |pool| async move {
                pool.health_monitor_tick().await;
            },
        ));
        if self.config.auto_scale.enabled {
            tasks.extend(self.spawn_loop(
                "auto_scaler",
                self.config.auto_scale.interval(),
                |pool| async move {
                    pool.autoscale_tick().await;
                },
            ));
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        info!(instances = initial, max = self.config.max_instances, "Instance pool started");
        Ok(())
    }

    fn spawn_loop<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        tick: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn(Arc<InstancePool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return None;
        }
        let weak: Weak<InstancePool> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if !pool.running.load(Ordering::SeqCst) {
                    break;
                }
                tick(pool).await;
            }

            debug!(task = name, "Pool loop stopped");
        }))
    }

    // ═══════════════════════════════════════════════════════════════════
    // INSTANCE SET
    // ═══════════════════════════════════════════════════════════════════

    /// Create an instance with the pool's instance settings.
    pub async fn create_instance(&self) -> PoolResult<InstanceId> {
        self.create_instance_with(self.config.instance.clone()).await
    }

    /// Create an instance; fails with `CapacityExceeded` at `max_instances`.
    #[instrument(skip(self, config))]
    pub async fn create_instance_with(&self, config: InstanceConfig) -> PoolResult<InstanceId> {
        let _creating = self.creating.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        let size = self.size();
        if size >= self.config.max_instances {
            warn!(size, max = self.config.max_instances, "Instance creation refused");
            return Err(PoolError::CapacityExceeded {
                max: self.config.max_instances,
            });
        }

        let instance = Instance::create(config, self.services.clone()).await?;
        instance.initialize()?;
        let instance_id = instance.id();
        let region = instance.identity().region;

        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instance);

        info!(instance_id = %instance_id, region = %region, size = size + 1, "Instance added to pool");
        self.emit(
            FleetEvent::InstanceCreated {
                instance_id,
                region,
            },
            EventSeverity::Info,
        );
        Ok(instance_id)
    }

    /// Shut an instance down and drop it from the pool. No-op when absent.
    pub fn remove_instance(&self, instance_id: &InstanceId) -> bool {
        self.retire(instance_id, "removed")
    }

    pub(crate) fn retire(&self, instance_id: &InstanceId, reason: &str) -> bool {
        let removed = {
            let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
            instances
                .iter()
                .position(|i| i.id() == *instance_id)
                .map(|idx| instances.remove(idx))
        };
        self.recovery.remove(instance_id);

        let Some(instance) = removed else {
            return false;
        };
        let live = instance.active_connections();
        if live > 0 {
            warn!(
                instance_id = %instance_id,
                reason,
                connections = live,
                "Retiring instance with live connections, their jobs are cancelled"
            );
        }
        instance.shutdown();

        info!(instance_id = %instance_id, reason, "Instance removed from pool");
        self.emit(
            FleetEvent::InstanceRemoved {
                instance_id: *instance_id,
                reason: reason.to_string(),
            },
            EventSeverity::Info,
        );
        true
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|i| i.id() == *instance_id)
            .cloned()
    }

    /// Instances in creation order.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn size(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn ready_count(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|i| i.state().is_eligible())
            .count()
    }

    pub fn active_connections(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|i| i.active_connections())
            .sum()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════
    // SELECTION AND ASSIGNMENT
    // ═══════════════════════════════════════════════════════════════════

    /// Best instance for new work, or `None` when nothing is ready.
    pub fn select_instance(&self, strategy: SelectionStrategy) -> Option<InstanceId> {
        self.select(strategy).map(|i| i.id())
    }

    fn select(&self, strategy: SelectionStrategy) -> Option<Arc<Instance>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        selection::select(strategy, &instances, &self.request_counter)
    }

    /// Select an instance and register a connection on it in one step.
    ///
    /// The returned handle already counts against the instance, so several
    /// assignments in a row spread across the pool.
    pub fn assign(
        &self,
        strategy: Option<SelectionStrategy>,
        target: impl Into<String>,
        options: EmbedOptions,
        job_id: Option<JobId>,
    ) -> PoolResult<PendingEmbed> {
        let strategy = strategy.unwrap_or(self.config.strategy);
        let instance = self
            .select(strategy)
            .ok_or(PoolError::NoAvailableInstance)?;

        // Lost a race with a health transition
        instance
            .begin_embed(target, options, job_id)
            .map_err(|_| PoolError::NoAvailableInstance)
    }

    /// Embed on the best instance and wait for the result.
    pub async fn embed(
        &self,
        target: impl Into<String>,
        options: EmbedOptions,
    ) -> PoolResult<EmbedOutput> {
        let pending = self.assign(None, target, options, None)?;
        Ok(pending.run().await?)
    }

    /// Forward a live command to one connection.
    pub async fn send_command(
        &self,
        instance_id: &InstanceId,
        connection_id: &ConnectionId,
        command: &SessionCommand,
    ) -> PoolResult<()> {
        let instance = self
            .get(instance_id)
            .ok_or(PoolError::InstanceNotFound(*instance_id))?;
        instance.send_command(connection_id, command).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // AUTO-SCALING
    // ═══════════════════════════════════════════════════════════════════

    pub fn scaling_context(&self) -> ScalingContext {
        let instances = self.instances();
        ScalingContext {
            total_instances: instances.len(),
            ready_instances: instances.iter().filter(|i| i.state().is_eligible()).count(),
            active_connections: instances
                .iter()
                .filter(|i| i.state().is_eligible())
                .map(|i| i.active_connections())
                .sum(),
            min_instances: self.config.min_instances,
            max_instances: self.config.max_instances,
            reference_load: self.config.reference_load(),
        }
    }

    /// Evaluate load once and apply the decision.
    pub async fn autoscale_tick(&self) -> ScalingDecision {
        let context = self.scaling_context();
        let decision = self.config.auto_scale.evaluate(&context);
        let before = context.total_instances;

        if decision == ScalingDecision::None {
            return decision;
        }

        match &decision {
            ScalingDecision::None => {}
            ScalingDecision::ScaleUp { count, reason } => {
                info!(count, reason = %reason, "Scaling up");
                for _ in 0..*count {
                    if let Err(e) = self.create_instance().await {
                        warn!(error = %e, "Scale-up instance creation failed");
                        break;
                    }
                }
            }
            ScalingDecision::ScaleDown { count, reason } => {
                info!(count, reason = %reason, "Scaling down");
                let mut by_load = self.instances();
                // Stable: equally loaded instances go oldest first
                by_load.sort_by_key(|i| i.active_connections());
                let floor = self.config.min_instances;
                for instance in by_load.into_iter().take(*count) {
                    if self.size() <= floor {
                        break;
                    }
                    self.retire(&instance.id(), "scaled down");
                }
            }
        }

        let after = self.size();
        if after != before {
            self.emit(
                FleetEvent::PoolScaled {
                    from: before,
                    to: after,
                    average_load: context.average_load(),
                },
                EventSeverity::Info,
            );
        }
        decision
    }

    // ═══════════════════════════════════════════════════════════════════
    // STATUS AND SHUTDOWN
    // ═══════════════════════════════════════════════════════════════════

    pub fn status(&self) -> PoolStatus {
        let instances = self.instances();
        PoolStatus {
            metrics: self.aggregate(&instances),
            instances: instances.iter().map(|i| i.snapshot()).collect(),
            max_instances: self.config.max_instances,
            min_instances: self.config.min_instances,
            auto_scale: self.config.auto_scale.enabled,
            strategy: self.config.strategy,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEventEnvelope> {
        self.services.events.subscribe()
    }

    /// Event stream shared by the pool and its instances.
    pub fn events(&self) -> &EventEmitter {
        &self.services.events
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the loops, let in-flight work drain for up to `grace`, then shut
    /// every instance down.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        for handle in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }

        let deadline = Instant::now() + grace;
        loop {
            let active = self.active_connections();
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(active, "Shutdown grace elapsed, terminating instances");
                break;
            }
            debug!(active, "Waiting for connections to drain");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let ids: Vec<InstanceId> = self.instances().iter().map(|i| i.id()).collect();
        for instance_id in &ids {
            self.retire(instance_id, "pool shutdown");
        }
        info!(instances = ids.len(), "Instance pool shut down");
    }

    pub(crate) fn emit(&self, event: FleetEvent, severity: EventSeverity) {
        self.services.events.emit(event, EventSource::Pool, severity);
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("size", &self.size())
            .field("max_instances", &self.config.max_instances)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_instance::StaticRenderer;

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_instances: max,
            instances_per_node: 1,
            health_monitor_interval_secs: 0,
            auto_scale: crate::config::AutoScaleConfig {
                enabled: false,
                ..Default::default()
            },
            instance: InstanceConfig::manual(),
            ..Default::default()
        }
    }

    fn pool(max: usize) -> Arc<InstancePool> {
        InstancePool::new(
            config(max),
            InstanceServices::new(Arc::new(StaticRenderer::new())),
        )
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let pool = pool(2);
        pool.create_instance().await.unwrap();
        pool.create_instance().await.unwrap();

        let err = pool.create_instance().await.unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { max: 2 }));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let pool = pool(2);
        let id = pool.create_instance().await.unwrap();
        let instance = pool.get(&id).unwrap();

        assert!(pool.remove_instance(&id));
        assert!(!pool.remove_instance(&id));
        assert_eq!(pool.size(), 0);
        assert_eq!(instance.state(), fleet_types::InstanceState::Shutdown);
    }

    #[tokio::test]
    async fn test_assign_without_instances() {
        let pool = pool(2);
        let err = pool
            .assign(None, "https://example.com", EmbedOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableInstance));
        assert!(pool.select_instance(SelectionStrategy::Random).is_none());
    }

    #[tokio::test]
    async fn test_assignments_spread_across_instances() {
        let pool = pool(2);
        let a = pool.create_instance().await.unwrap();
        let b = pool.create_instance().await.unwrap();

        let first = pool
            .assign(None, "https://a.example", EmbedOptions::default(), None)
            .unwrap();
        let second = pool
            .assign(None, "https://b.example", EmbedOptions::default(), None)
            .unwrap();

        assert_eq!(first.instance_id(), a);
        assert_eq!(second.instance_id(), b);
        assert_eq!(pool.active_connections(), 2);
    }

    #[tokio::test]
    async fn test_embed_through_pool() {
        let pool = pool(1);
        pool.start().await.unwrap();

        let output = pool
            .embed("https://example.com", EmbedOptions::default())
            .await
            .unwrap();
        assert_eq!(output.attempts, 1);

        let status = pool.status();
        assert_eq!(status.instances.len(), 1);
        assert_eq!(status.metrics.total_requests, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let pool = pool(2);
        pool.start().await.unwrap();

        pool.shutdown(Duration::from_millis(100)).await;

        assert_eq!(pool.size(), 0);
        assert!(matches!(
            pool.create_instance().await,
            Err(PoolError::ShuttingDown)
        ));
        assert!(pool.select_instance(SelectionStrategy::LeastConnections).is_none());
    }
}
