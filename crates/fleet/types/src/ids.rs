//! Strongly-typed identifiers for fleet entities
//!
//! All IDs are UUID-based but wrapped in newtype structs for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a proxy instance
    InstanceId,
    "instance"
);

uuid_id!(
    /// Unique identifier for a single embedding job
    JobId,
    "job"
);

uuid_id!(
    /// Identifier shared by every job submitted in one call
    BatchId,
    "batch"
);

uuid_id!(
    /// Identifier of an in-flight connection on an instance
    ConnectionId,
    "conn"
);

uuid_id!(
    /// Identifier of a live-viewing session
    SessionId,
    "session"
);

/// Identifier of a shard inside a massive submission.
///
/// Shards are addressed by their batch and their position in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub batch_id: BatchId,
    pub index: u32,
}

impl ShardId {
    pub fn new(batch_id: BatchId, index: u32) -> Self {
        Self { batch_id, index }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/shard:{}", self.batch_id, self.index)
    }
}
