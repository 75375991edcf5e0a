//! Fleet Types - Core types for the embedding fleet
//!
//! The fleet dispatches a very large number of short-lived embedding jobs
//! (fetch-and-render a target) across a pool of stateful proxy instances,
//! each carrying its own rotating outbound identity and health state.
//!
//! ## Architectural Boundaries
//!
//! - **fleet-instance** owns: a single instance's connections, identity and health
//! - **fleet-pool** owns: the instance set, selection, health monitoring and scaling
//! - **fleet-scheduler** owns: priority queues, batches, shards and retries
//!
//! ## Key Concepts
//!
//! - **Instance**: one worker identity (region, user-agent, endpoint) with health state
//! - **Job**: one embedding request with priority and retry state
//! - **Batch**: jobs submitted together, optionally split into **Shards**
//! - **Events**: unified lifecycle stream for observability

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod batch;
pub mod events;
pub mod identity;
pub mod ids;
pub mod instance;
pub mod job;
pub mod session;

// Re-export main types
pub use batch::{BatchStatus, ShardState, ShardStatus, StatusCounts};
pub use events::{EventSeverity, EventSource, FleetEvent, FleetEventEnvelope};
pub use identity::Identity;
pub use ids::{BatchId, ConnectionId, InstanceId, JobId, SessionId, ShardId};
pub use instance::{
    ConnectionInfo, InstanceMetrics, InstanceSnapshot, InstanceState, ResourceLimits,
    ResourceUsage,
};
pub use job::{EmbedOptions, EmbedOutput, Job, JobSpec, JobStatus};
pub use session::{CommandReport, SessionCommand, SessionSnapshot};
