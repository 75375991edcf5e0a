//! Fleet Scheduler - the parallel job engine
//!
//! Accepts embedding jobs at any rate, queues them in strict-priority FIFO
//! buckets and dispatches them onto the instance pool under a global
//! concurrency ceiling.
//!
//! ## Guarantees
//!
//! - A job is in at most one bucket at a time, and owned by exactly one
//!   instance while processing
//! - Bucket 0 is drained before bucket 1 is served, and so on
//! - Failed jobs are re-queued at the back of the next lower bucket until
//!   their retries run out, then marked failed
//! - Every job ends completed, failed or cancelled
//!
//! Massive submissions are split into contiguous shards tracked
//! independently; live sessions receive periodic snapshots of the jobs they
//! watch and can fan commands out to their connections.

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod session;
pub mod shard;
mod state;

pub use config::SchedulerConfig;
pub use engine::JobEngine;
pub use error::{SchedulerError, SchedulerResult};
pub use metrics::{EngineMetrics, SystemStatus};
pub use queue::PriorityQueues;
pub use shard::partition;
