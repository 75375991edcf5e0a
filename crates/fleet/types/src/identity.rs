//! Outbound identity carried by an instance.

use serde::{Deserialize, Serialize};

/// The outbound identity an instance presents to targets.
///
/// Regenerated on rotation; the region determines which user-agents
/// and endpoints are plausible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Region code (e.g. `eu-west`)
    pub region: String,

    /// User-agent string sent with every fetch
    pub user_agent: String,

    /// Label of the outbound endpoint in use
    pub endpoint: String,
}

impl Identity {
    pub fn new(
        region: impl Into<String>,
        user_agent: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            region: region.into(),
            user_agent: user_agent.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Same region and endpoint, different user-agent.
    pub fn with_user_agent(&self, user_agent: impl Into<String>) -> Self {
        Self {
            region: self.region.clone(),
            user_agent: user_agent.into(),
            endpoint: self.endpoint.clone(),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.region)
    }
}
