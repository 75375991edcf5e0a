//! A single proxy instance.
//!
//! The instance owns its connection table, identity and metrics. Everything
//! outside reaches them through the methods below.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_types::{
    ConnectionId, ConnectionInfo, EmbedOptions, EmbedOutput, EventSeverity, EventSource,
    FleetEvent, Identity, InstanceId, InstanceMetrics, InstanceSnapshot, InstanceState, JobId,
    ResourceUsage, SessionCommand,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{RenderRequest, Renderer};
use crate::config::InstanceConfig;
use crate::controller;
use crate::error::{EmbedError, EmbedResult, InstanceError, InstanceResult};
use crate::events::EventEmitter;
use crate::identity::{IdentityPolicy, StaticIdentityPolicy};
use crate::sampler::{ConnectionLoadSampler, ResourceSampler};

/// Collaborators shared by every instance of a pool.
#[derive(Clone)]
pub struct InstanceServices {
    pub renderer: Arc<dyn Renderer>,
    pub identity_policy: Arc<dyn IdentityPolicy>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub events: EventEmitter,
}

impl InstanceServices {
    /// Default identity policy, sampler and a fresh event channel.
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            identity_policy: Arc::new(StaticIdentityPolicy::default()),
            sampler: Arc::new(ConnectionLoadSampler::default()),
            events: EventEmitter::default(),
        }
    }

    pub fn with_identity_policy(mut self, policy: Arc<dyn IdentityPolicy>) -> Self {
        self.identity_policy = policy;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }
}

/// Result of an identity rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// New identity in the same region.
    Rotated { region: String, migrated: usize },
    /// Rotation failed; identity moved to a neighbouring region.
    FailedOver {
        from: String,
        to: String,
        migrated: usize,
    },
    /// Rotation and every failover candidate failed; instance marked unhealthy.
    Degraded { reason: String },
    /// Instance is shutting down or rotation was not due.
    Skipped,
}

/// Result of one health classification.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    pub healthy: bool,
    /// Violated conditions; empty when healthy
    pub reasons: Vec<String>,
    pub usage: ResourceUsage,
    pub active_connections: usize,
    pub avg_latency_ms: f64,
}

/// One stateful worker identity.
pub struct Instance {
    id: InstanceId,
    config: InstanceConfig,
    created_at: DateTime<Utc>,
    state: RwLock<InstanceState>,
    identity: RwLock<Identity>,
    metrics: RwLock<InstanceMetrics>,
    connections: DashMap<ConnectionId, ConnectionInfo>,
    recent_targets: Mutex<VecDeque<String>>,
    last_rotation: Mutex<Instant>,
    /// Set when rotation and failover both failed
    identity_degraded: AtomicBool,
    rotation_lock: tokio::sync::Mutex<()>,
    services: InstanceServices,
    shutdown_tx: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    /// Create an instance in `initializing` with an identity in the home region.
    pub async fn create(
        config: InstanceConfig,
        services: InstanceServices,
    ) -> InstanceResult<Arc<Self>> {
        let identity = services
            .identity_policy
            .generate(&config.home_region)
            .await?;
        let (shutdown_tx, _) = watch::channel(false);

        let instance = Arc::new(Self {
            id: InstanceId::generate(),
            created_at: Utc::now(),
            state: RwLock::new(InstanceState::Initializing),
            identity: RwLock::new(identity),
            metrics: RwLock::new(InstanceMetrics::default()),
            connections: DashMap::new(),
            recent_targets: Mutex::new(VecDeque::with_capacity(config.recent_targets)),
            last_rotation: Mutex::new(Instant::now()),
            identity_degraded: AtomicBool::new(false),
            rotation_lock: tokio::sync::Mutex::new(()),
            services,
            shutdown_tx,
            timers: Mutex::new(Vec::new()),
            config,
        });

        debug!(instance_id = %instance.id, region = %instance.config.home_region, "Instance created");
        Ok(instance)
    }

    /// Move to `ready` and start the rotation and health timers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(self: &Arc<Self>) -> InstanceResult<()> {
        self.transition(InstanceState::Ready)?;

        let handles = controller::spawn_timers(self);
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        info!(instance_id = %self.id, identity = %self.identity(), "Instance ready");
        Ok(())
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> Identity {
        self.identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn metrics(&self) -> InstanceMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .avg_latency_ms
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Ready and below its connection limit.
    pub fn is_available(&self) -> bool {
        self.state().is_eligible() && self.active_connections() < self.config.limits.max_connections
    }

    pub fn connections(&self) -> Vec<(ConnectionId, ConnectionInfo)> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            state: self.state(),
            identity: self.identity(),
            active_connections: self.active_connections(),
            limits: self.config.limits.clone(),
            metrics: self.metrics(),
            created_at: self.created_at,
            recent_targets: self
                .recent_targets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // EMBED
    // ═══════════════════════════════════════════════════════════════════

    /// Register a connection for `target` and return a handle that runs it.
    ///
    /// The connection counts against this instance immediately; dropping the
    /// handle without running it releases the slot.
    pub fn begin_embed(
        self: &Arc<Self>,
        target: impl Into<String>,
        options: EmbedOptions,
        job_id: Option<JobId>,
    ) -> EmbedResult<PendingEmbed> {
        let state = self.state();
        if !state.is_eligible() {
            return Err(EmbedError::NotReady {
                instance_id: self.id,
                state,
            });
        }

        let target = target.into();
        let connection_id = ConnectionId::generate();
        {
            // Hold the identity so a concurrent rotation migrates this connection too
            let identity = self.identity.read().unwrap_or_else(PoisonError::into_inner);
            self.connections.insert(
                connection_id,
                ConnectionInfo {
                    target: target.clone(),
                    job_id,
                    started_at: Utc::now(),
                    retry_count: 0,
                    identity: identity.clone(),
                },
            );
        }

        Ok(PendingEmbed {
            guard: ConnectionGuard {
                instance: Arc::clone(self),
                connection_id,
            },
            target,
            options,
        })
    }

    /// Embed `target` on this instance and wait for the result.
    pub async fn embed(
        self: &Arc<Self>,
        target: impl Into<String>,
        options: EmbedOptions,
    ) -> EmbedResult<EmbedOutput> {
        self.begin_embed(target, options, None)?.run().await
    }

    fn prepare_attempt(&self, connection_id: &ConnectionId, attempt: u32) -> Option<Identity> {
        self.connections.get_mut(connection_id).map(|mut connection| {
            connection.retry_count = attempt.saturating_sub(1);
            connection.identity.clone()
        })
    }

    fn record_attempt(&self, success: bool, latency_ms: f64) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.requests += 1;
        if success {
            metrics.successes += 1;
        } else {
            metrics.failures += 1;
        }
        metrics.record_latency(latency_ms, self.config.latency_smoothing);
        metrics.last_activity = Some(Utc::now());
    }

    fn remember_target(&self, target: &str) {
        if self.config.recent_targets == 0 {
            return;
        }
        let mut recent = self
            .recent_targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        recent.push_back(target.to_string());
        while recent.len() > self.config.recent_targets {
            recent.pop_front();
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // ROTATION
    // ═══════════════════════════════════════════════════════════════════

    /// Regenerate the identity in the current region, failing over to a
    /// neighbouring region when that is impossible.
    #[instrument(skip(self), fields(instance_id = %self.id))]
    pub async fn rotate(&self) -> RotationOutcome {
        let _rotation = self.rotation_lock.lock().await;
        self.rotate_locked().await
    }

    /// Rotate only if the rotation interval elapsed since the last rotation.
    pub async fn rotate_if_due(&self) -> RotationOutcome {
        if !self.rotation_due() {
            return RotationOutcome::Skipped;
        }
        let _rotation = self.rotation_lock.lock().await;
        // Another task may have rotated while we waited
        if !self.rotation_due() {
            return RotationOutcome::Skipped;
        }
        self.rotate_locked().await
    }

    fn rotation_due(&self) -> bool {
        let interval = self.config.rotation_interval();
        !interval.is_zero()
            && self
                .last_rotation
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .elapsed()
                >= interval
    }

    async fn rotate_locked(&self) -> RotationOutcome {
        if self.state().is_terminal() {
            return RotationOutcome::Skipped;
        }

        let current = self.identity();
        let outcome = match self
            .services
            .identity_policy
            .generate(&current.region)
            .await
        {
            Ok(identity) => {
                let endpoint = identity.endpoint.clone();
                let migrated = self.apply_identity(identity);
                self.identity_degraded.store(false, Ordering::SeqCst);
                self.update_metrics(|m| m.rotations += 1);

                info!(region = %current.region, endpoint = %endpoint, migrated, "Identity rotated");
                self.emit(
                    FleetEvent::IdentityRotated {
                        instance_id: self.id,
                        region: current.region.clone(),
                        endpoint,
                        migrated_connections: migrated,
                    },
                    EventSeverity::Info,
                );
                RotationOutcome::Rotated {
                    region: current.region.clone(),
                    migrated,
                }
            }
            Err(e) => {
                warn!(region = %current.region, error = %e, "Identity rotation failed, attempting failover");
                self.update_metrics(|m| m.failovers += 1);
                self.failover(&current, e.to_string()).await
            }
        };

        *self
            .last_rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        outcome
    }

    async fn failover(&self, current: &Identity, reason: String) -> RotationOutcome {
        for region in self.services.identity_policy.neighbours(&current.region) {
            match self.services.identity_policy.generate(&region).await {
                Ok(identity) => {
                    let migrated = self.apply_identity(identity);
                    self.identity_degraded.store(false, Ordering::SeqCst);

                    info!(from_region = %current.region, to_region = %region, migrated, "Instance failed over");
                    self.emit(
                        FleetEvent::InstanceFailedOver {
                            instance_id: self.id,
                            from_region: current.region.clone(),
                            to_region: region.clone(),
                            migrated_connections: migrated,
                        },
                        EventSeverity::Warning,
                    );
                    return RotationOutcome::FailedOver {
                        from: current.region.clone(),
                        to: region,
                        migrated,
                    };
                }
                Err(e) => debug!(region = %region, error = %e, "Failover candidate rejected"),
            }
        }

        error!(region = %current.region, reason = %reason, "No failover region available, instance degraded");
        self.identity_degraded.store(true, Ordering::SeqCst);
        if self.state() == InstanceState::Ready {
            if let Err(e) = self.transition(InstanceState::Unhealthy) {
                debug!(error = %e, "Could not mark degraded instance unhealthy");
            }
        }
        self.emit(
            FleetEvent::RotationFailed {
                instance_id: self.id,
                reason: reason.clone(),
            },
            EventSeverity::Error,
        );
        RotationOutcome::Degraded { reason }
    }

    /// Swap only the user-agent, keeping region and endpoint.
    #[instrument(skip(self), fields(instance_id = %self.id))]
    pub async fn rotate_user_agent(&self) -> InstanceResult<()> {
        let _rotation = self.rotation_lock.lock().await;
        if self.state().is_terminal() {
            return Ok(());
        }

        let current = self.identity();
        let next = self
            .services
            .identity_policy
            .rotate_user_agent(&current)
            .await?;
        let migrated = self.apply_identity(next);

        debug!(migrated, "User-agent rotated");
        self.emit(
            FleetEvent::UserAgentRotated {
                instance_id: self.id,
            },
            EventSeverity::Debug,
        );
        Ok(())
    }

    /// Install `identity` and migrate every active connection to it.
    fn apply_identity(&self, identity: Identity) -> usize {
        let mut current = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        let mut migrated = 0;
        for mut connection in self.connections.iter_mut() {
            connection.identity = identity.clone();
            migrated += 1;
        }
        *current = identity;
        migrated
    }

    // ═══════════════════════════════════════════════════════════════════
    // HEALTH
    // ═══════════════════════════════════════════════════════════════════

    /// Reclassify the instance as ready or unhealthy from its current load.
    pub fn health_check(&self) -> HealthReport {
        let active = self.active_connections();
        let usage = self.services.sampler.sample(&self.id, active);
        let avg_latency_ms = {
            let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            metrics.usage = usage;
            metrics.avg_latency_ms
        };

        let limits = &self.config.limits;
        let mut reasons = Vec::new();
        if usage.memory_mb > limits.max_memory_mb {
            reasons.push(format!(
                "memory {:.0}MB over budget {:.0}MB",
                usage.memory_mb, limits.max_memory_mb
            ));
        }
        if usage.cpu_percent > limits.max_cpu_percent {
            reasons.push(format!(
                "cpu {:.1}% over budget {:.1}%",
                usage.cpu_percent, limits.max_cpu_percent
            ));
        }
        if avg_latency_ms > limits.max_response_time_ms {
            reasons.push(format!(
                "response time {:.0}ms over budget {:.0}ms",
                avg_latency_ms, limits.max_response_time_ms
            ));
        }
        if active >= limits.max_connections {
            reasons.push(format!(
                "{} active connections at limit {}",
                active, limits.max_connections
            ));
        }
        if self.identity_degraded.load(Ordering::SeqCst) {
            reasons.push("no usable identity".to_string());
        }

        let healthy = reasons.is_empty();
        let next = match (self.state(), healthy) {
            (InstanceState::Ready, false) => Some(InstanceState::Unhealthy),
            (InstanceState::Unhealthy, true) => Some(InstanceState::Ready),
            _ => None,
        };
        if let Some(next) = next {
            if let Err(e) = self.transition(next) {
                debug!(instance_id = %self.id, error = %e, "Health transition skipped");
            }
        }

        let snapshot = self.snapshot();
        let state = snapshot.state;
        self.emit(
            FleetEvent::HealthSnapshot {
                snapshot: Box::new(snapshot),
                reasons: reasons.clone(),
            },
            if healthy {
                EventSeverity::Debug
            } else {
                EventSeverity::Warning
            },
        );

        HealthReport {
            instance_id: self.id,
            state,
            healthy,
            reasons,
            usage,
            active_connections: active,
            avg_latency_ms,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // COMMANDS AND SHUTDOWN
    // ═══════════════════════════════════════════════════════════════════

    /// Forward a live command to one in-flight connection.
    pub async fn send_command(
        &self,
        connection_id: &ConnectionId,
        command: &SessionCommand,
    ) -> InstanceResult<()> {
        let connection = self
            .connection(connection_id)
            .ok_or(InstanceError::ConnectionNotFound(*connection_id))?;

        self.services
            .renderer
            .execute_command(&connection, command)
            .await
            .map_err(|e| InstanceError::CommandFailed(e.to_string()))
    }

    /// Stop timers, close every connection without waiting and move to `shutdown`.
    pub fn shutdown(&self) {
        if matches!(
            self.state(),
            InstanceState::ShuttingDown | InstanceState::Shutdown
        ) {
            return;
        }
        if let Err(e) = self.transition(InstanceState::ShuttingDown) {
            warn!(instance_id = %self.id, error = %e, "Shutdown refused");
            return;
        }

        self.shutdown_tx.send_replace(true);
        for handle in self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }

        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        let mut closed = 0;
        for connection_id in ids {
            if let Some((_, connection)) = self.connections.remove(&connection_id) {
                closed += 1;
                self.emit(
                    FleetEvent::ConnectionClosed {
                        instance_id: self.id,
                        connection_id,
                        target: connection.target,
                    },
                    EventSeverity::Debug,
                );
            }
        }

        if let Err(e) = self.transition(InstanceState::Shutdown) {
            warn!(instance_id = %self.id, error = %e, "Could not complete shutdown");
        }
        info!(instance_id = %self.id, closed, "Instance shut down");
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn transition(&self, next: InstanceState) -> InstanceResult<()> {
        let from = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if from == next {
                return Ok(());
            }
            if !from.can_transition_to(next) {
                return Err(InstanceError::InvalidTransition { from, to: next });
            }
            *state = next;
            from
        };

        debug!(instance_id = %self.id, from = %from, to = %next, "Instance state changed");
        let severity = match next {
            InstanceState::Unhealthy => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        self.emit(
            FleetEvent::InstanceStateChanged {
                instance_id: self.id,
                from,
                to: next,
            },
            severity,
        );
        Ok(())
    }

    fn update_metrics(&self, f: impl FnOnce(&mut InstanceMetrics)) {
        f(&mut self.metrics.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn emit(&self, event: FleetEvent, severity: EventSeverity) {
        self.services
            .events
            .emit(event, EventSource::Instance, severity);
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// Removes its connection from the instance when dropped.
struct ConnectionGuard {
    instance: Arc<Instance>,
    connection_id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.instance.connections.remove(&self.connection_id);
    }
}

/// An embed whose connection is registered but whose fetch has not started.
pub struct PendingEmbed {
    guard: ConnectionGuard,
    target: String,
    options: EmbedOptions,
}

impl PendingEmbed {
    pub fn instance_id(&self) -> InstanceId {
        self.guard.instance.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.guard.instance
    }

    /// Execute the fetch with bounded internal retries.
    ///
    /// The connection is released when this returns.
    #[instrument(
        skip(self),
        fields(instance_id = %self.guard.instance.id, connection_id = %self.guard.connection_id)
    )]
    pub async fn run(self) -> EmbedResult<EmbedOutput> {
        let instance = Arc::clone(&self.guard.instance);
        let connection_id = self.guard.connection_id;
        instance.rotate_if_due().await;

        let timeout = self
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| instance.config.embed_timeout());
        let timeout_ms = timeout.as_millis() as u64;
        let retry_delay = instance.config.retry_delay();
        let max_attempts = instance.config.retry_attempts.saturating_add(1);
        let mut shutdown_rx = instance.shutdown_receiver();
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if *shutdown_rx.borrow() {
                return Err(EmbedError::Cancelled);
            }
            let identity = instance
                .prepare_attempt(&connection_id, attempt)
                .ok_or(EmbedError::Cancelled)?;

            let request = RenderRequest {
                target: self.target.clone(),
                identity,
                options: self.options.clone(),
                attempt,
            };

            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                result = tokio::time::timeout(timeout, instance.services.renderer.fetch(&request)) => {
                    match result {
                        Ok(Ok(page)) => Ok(page),
                        Ok(Err(e)) => Err(EmbedError::Upstream(e.to_string())),
                        Err(_) => Err(EmbedError::Timeout { timeout_ms }),
                    }
                }
                _ = shutdown_rx.changed() => Err(EmbedError::Cancelled),
            };
            let latency_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(page) => {
                    instance.record_attempt(true, latency_ms);
                    instance.remember_target(&self.target);
                    debug!(attempt, latency_ms, "Embed succeeded");

                    return Ok(EmbedOutput {
                        content: page.content,
                        metadata: page.metadata,
                        instance_id: instance.id,
                        identity: request.identity,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                    });
                }
                Err(EmbedError::Cancelled) => return Err(EmbedError::Cancelled),
                Err(e) => {
                    instance.record_attempt(false, latency_ms);
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %e, "Embed failed");
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "Embed attempt failed, retrying");

                    if !retry_delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(retry_delay) => {}
                            _ = shutdown_rx.changed() => return Err(EmbedError::Cancelled),
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PendingEmbed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEmbed")
            .field("instance_id", &self.guard.instance.id)
            .field("connection_id", &self.guard.connection_id)
            .field("target", &self.target)
            .finish()
    }
}
