//! Error types for fleet-pool crate.

use fleet_instance::{EmbedError, InstanceError};
use fleet_types::InstanceId;
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Pool already holds the maximum number of instances.
    #[error("pool capacity exceeded (max {max} instances)")]
    CapacityExceeded { max: usize },

    /// No ready instance can take work.
    #[error("no available instance")]
    NoAvailableInstance,

    /// Instance is not part of the pool.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Pool is shutting down and refuses new work.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// Instance lifecycle failure.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Embed failed on the chosen instance.
    #[error(transparent)]
    Embed(#[from] EmbedError),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
