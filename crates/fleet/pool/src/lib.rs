//! Fleet Pool - the set of proxy instances
//!
//! The pool creates and removes instances, picks the best one for each job
//! and keeps the fleet sized to its load:
//!
//! - **Selection**: least-connections (default), fastest-response,
//!   round-robin or random, over ready instances below their connection limit
//! - **Health monitor**: unhealthy instances get a recovery window, then are
//!   replaced
//! - **Auto-scaler**: adds or removes instances between `min_instances` and
//!   `max_instances` based on average connections per ready instance

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod scaling;
pub mod selection;

pub use config::{AutoScaleConfig, PoolConfig};
pub use error::{PoolError, PoolResult};
pub use monitor::PoolMetrics;
pub use pool::{InstancePool, PoolStatus};
pub use scaling::{ScalingContext, ScalingDecision};
pub use selection::SelectionStrategy;
