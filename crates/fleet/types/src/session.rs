//! Live-viewing session types

use std::collections::HashMap;

use crate::{Job, JobId, SessionId};
use serde::{Deserialize, Serialize};

/// Periodic view of the jobs a session watches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,

    /// Monotonic per-session counter
    pub sequence: u64,

    pub taken_at: chrono::DateTime<chrono::Utc>,

    /// Jobs that could be read
    pub jobs: Vec<Job>,

    /// Watched jobs that are unknown or already purged
    pub missing: Vec<JobId>,
}

/// Command forwarded to every connection of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCommand {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl SessionCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Aggregate outcome of a command fan-out
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandReport {
    pub delivered: usize,
    pub failed: usize,
    /// One entry per failed delivery
    pub errors: Vec<String>,
}

impl CommandReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}
