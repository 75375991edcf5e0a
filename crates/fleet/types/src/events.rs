//! Event types for fleet observability
//!
//! Events provide a unified stream of instance, pool and job lifecycle activities.

use crate::{
    BatchId, ConnectionId, InstanceId, InstanceSnapshot, InstanceState, JobId, ShardId,
    ShardState,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all fleet events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// The actual event
    pub event: FleetEvent,
}

impl FleetEventEnvelope {
    pub fn new(event: FleetEvent, source: EventSource, severity: EventSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity,
            event,
        }
    }
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    /// A single proxy instance
    Instance,
    /// The instance pool (health monitor, auto-scaler)
    Pool,
    /// The job scheduler
    Scheduler,
    /// Live-viewing sessions
    Session,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Fleet events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetEvent {
    // ═══════════════════════════════════════════════════════════════════
    // INSTANCE EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// Instance state changed
    InstanceStateChanged {
        instance_id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },

    /// Identity regenerated in the same region
    IdentityRotated {
        instance_id: InstanceId,
        region: String,
        endpoint: String,
        migrated_connections: usize,
    },

    /// Only the user-agent was swapped
    UserAgentRotated {
        instance_id: InstanceId,
    },

    /// Identity moved to a neighbouring region after a rotation failure
    InstanceFailedOver {
        instance_id: InstanceId,
        from_region: String,
        to_region: String,
        migrated_connections: usize,
    },

    /// Rotation failed and no neighbour could take over
    RotationFailed {
        instance_id: InstanceId,
        reason: String,
    },

    /// Periodic health classification of an instance
    HealthSnapshot {
        snapshot: Box<InstanceSnapshot>,
        reasons: Vec<String>,
    },

    /// Connection closed by shutdown before completing
    ConnectionClosed {
        instance_id: InstanceId,
        connection_id: ConnectionId,
        target: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // POOL EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// Instance added to the pool
    InstanceCreated {
        instance_id: InstanceId,
        region: String,
    },

    /// Instance removed from the pool
    InstanceRemoved {
        instance_id: InstanceId,
        reason: String,
    },

    /// Unhealthy instance replaced after its recovery window
    InstanceReplaced {
        removed: InstanceId,
        replacement: InstanceId,
    },

    /// Auto-scaler changed the pool size
    PoolScaled {
        from: usize,
        to: usize,
        average_load: f64,
    },

    // ═══════════════════════════════════════════════════════════════════
    // SCHEDULER EVENTS
    // ═══════════════════════════════════════════════════════════════════
    /// Jobs accepted into the queues
    BatchSubmitted {
        batch_id: BatchId,
        jobs: usize,
        priority: u8,
        shards: usize,
    },

    /// Job handed to an instance
    JobDispatched {
        job_id: JobId,
        instance_id: InstanceId,
        attempt: u32,
    },

    /// Job finished successfully
    JobCompleted {
        job_id: JobId,
        instance_id: InstanceId,
        processing_ms: u64,
    },

    /// Job failed and was re-queued at a lower priority
    JobRetrying {
        job_id: JobId,
        retry_count: u32,
        priority: u8,
        error: String,
    },

    /// Job failed permanently
    JobFailed {
        job_id: JobId,
        error: String,
    },

    /// Job removed before dispatch
    JobCancelled {
        job_id: JobId,
    },

    /// Every job of a shard settled
    ShardFinished {
        shard_id: ShardId,
        state: ShardState,
    },

    /// Every job of a batch settled
    BatchFinished {
        batch_id: BatchId,
        completed: usize,
        failed: usize,
    },
}

impl FleetEvent {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::InstanceStateChanged { .. } => "instance_state_changed",
            FleetEvent::IdentityRotated { .. } => "identity_rotated",
            FleetEvent::UserAgentRotated { .. } => "user_agent_rotated",
            FleetEvent::InstanceFailedOver { .. } => "instance_failed_over",
            FleetEvent::RotationFailed { .. } => "rotation_failed",
            FleetEvent::HealthSnapshot { .. } => "health_snapshot",
            FleetEvent::ConnectionClosed { .. } => "connection_closed",
            FleetEvent::InstanceCreated { .. } => "instance_created",
            FleetEvent::InstanceRemoved { .. } => "instance_removed",
            FleetEvent::InstanceReplaced { .. } => "instance_replaced",
            FleetEvent::PoolScaled { .. } => "pool_scaled",
            FleetEvent::BatchSubmitted { .. } => "batch_submitted",
            FleetEvent::JobDispatched { .. } => "job_dispatched",
            FleetEvent::JobCompleted { .. } => "job_completed",
            FleetEvent::JobRetrying { .. } => "job_retrying",
            FleetEvent::JobFailed { .. } => "job_failed",
            FleetEvent::JobCancelled { .. } => "job_cancelled",
            FleetEvent::ShardFinished { .. } => "shard_finished",
            FleetEvent::BatchFinished { .. } => "batch_finished",
        }
    }
}
