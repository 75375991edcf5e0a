//! Error types for fleet-instance crate.

use fleet_types::{ConnectionId, InstanceId, InstanceState};
use thiserror::Error;

/// Errors surfaced by `embed` to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbedError {
    /// Instance is not in the `ready` state.
    #[error("instance {instance_id} not ready (state: {state})")]
    NotReady {
        instance_id: InstanceId,
        state: InstanceState,
    },

    /// Renderer collaborator failed on the last attempt.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Last attempt exceeded the per-attempt timeout.
    #[error("embed timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection was closed by instance shutdown.
    #[error("connection closed by instance shutdown")]
    Cancelled,
}

impl EmbedError {
    /// Transient errors retried inside the instance.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Upstream(_) | EmbedError::Timeout { .. })
    }
}

/// Errors from identity generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The policy knows nothing about the region.
    #[error("unknown region: {0}")]
    UnknownRegion(String),

    /// The region has no usable identity left.
    #[error("no identity available in region {region}: {reason}")]
    Unavailable { region: String, reason: String },
}

/// Instance lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum InstanceError {
    /// The FSM does not allow this transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    /// Initial identity could not be generated.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// No in-flight connection with this ID.
    #[error("connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Renderer rejected a command.
    #[error("command failed: {0}")]
    CommandFailed(String),
}

/// Result type for embed operations.
pub type EmbedResult<T> = Result<T, EmbedError>;

/// Result type for instance operations.
pub type InstanceResult<T> = Result<T, InstanceError>;
