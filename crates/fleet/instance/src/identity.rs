//! Identity generation and regional failover policy.

use std::collections::HashMap;

use async_trait::async_trait;
use fleet_types::Identity;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::IdentityError;

/// Decides which identities an instance may present.
#[async_trait]
pub trait IdentityPolicy: Send + Sync {
    /// Fresh identity inside `region`.
    async fn generate(&self, region: &str) -> Result<Identity, IdentityError>;

    /// Same region and endpoint, new user-agent.
    async fn rotate_user_agent(&self, current: &Identity) -> Result<Identity, IdentityError>;

    /// Failover candidates for `region`, nearest first.
    fn neighbours(&self, region: &str) -> Vec<String>;
}

/// Fixed user-agent catalogue and proximity table.
#[derive(Debug, Clone)]
pub struct StaticIdentityPolicy {
    user_agents: HashMap<String, Vec<String>>,
    proximity: HashMap<String, Vec<String>>,
    endpoints_per_region: u32,
}

const CHROME_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const FIREFOX_WIN: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0";
const FIREFOX_LINUX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";
const SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15";
const EDGE_WIN: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0";
const CHROME_ANDROID: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36";
const SAFARI_IOS: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

impl StaticIdentityPolicy {
    /// Empty policy; add regions with [`StaticIdentityPolicy::with_region`].
    pub fn empty() -> Self {
        Self {
            user_agents: HashMap::new(),
            proximity: HashMap::new(),
            endpoints_per_region: 16,
        }
    }

    pub fn with_region<U, N>(mut self, region: &str, user_agents: U, neighbours: N) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        self.user_agents.insert(
            region.to_string(),
            user_agents.into_iter().map(Into::into).collect(),
        );
        self.proximity.insert(
            region.to_string(),
            neighbours.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_endpoints_per_region(mut self, count: u32) -> Self {
        self.endpoints_per_region = count.max(1);
        self
    }

    pub fn regions(&self) -> Vec<&str> {
        let mut regions: Vec<&str> = self.user_agents.keys().map(String::as_str).collect();
        regions.sort_unstable();
        regions
    }

    fn catalogue(&self, region: &str) -> Result<&[String], IdentityError> {
        let agents = self
            .user_agents
            .get(region)
            .ok_or_else(|| IdentityError::UnknownRegion(region.to_string()))?;
        if agents.is_empty() {
            return Err(IdentityError::Unavailable {
                region: region.to_string(),
                reason: "empty user-agent catalogue".to_string(),
            });
        }
        Ok(agents)
    }
}

impl Default for StaticIdentityPolicy {
    fn default() -> Self {
        Self::empty()
            .with_region(
                "us-east",
                [CHROME_WIN, EDGE_WIN, SAFARI_MAC, SAFARI_IOS],
                ["us-west", "eu-west", "sa-east"],
            )
            .with_region(
                "us-west",
                [CHROME_MAC, SAFARI_MAC, CHROME_WIN, SAFARI_IOS],
                ["us-east", "ap-northeast"],
            )
            .with_region(
                "eu-west",
                [CHROME_WIN, FIREFOX_WIN, SAFARI_MAC],
                ["eu-central", "us-east"],
            )
            .with_region(
                "eu-central",
                [FIREFOX_WIN, FIREFOX_LINUX, CHROME_WIN],
                ["eu-west", "us-east"],
            )
            .with_region(
                "ap-southeast",
                [CHROME_ANDROID, CHROME_WIN, SAFARI_IOS],
                ["ap-northeast", "us-west"],
            )
            .with_region(
                "ap-northeast",
                [SAFARI_IOS, CHROME_WIN, CHROME_ANDROID],
                ["ap-southeast", "us-west"],
            )
            .with_region(
                "sa-east",
                [CHROME_ANDROID, CHROME_WIN, EDGE_WIN],
                ["us-east", "us-west"],
            )
    }
}

#[async_trait]
impl IdentityPolicy for StaticIdentityPolicy {
    async fn generate(&self, region: &str) -> Result<Identity, IdentityError> {
        let agents = self.catalogue(region)?;
        let mut rng = rand::thread_rng();
        let user_agent = agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default();
        let endpoint = format!(
            "{}-edge-{:03}",
            region,
            rng.gen_range(1..=self.endpoints_per_region)
        );

        Ok(Identity::new(region, user_agent, endpoint))
    }

    async fn rotate_user_agent(&self, current: &Identity) -> Result<Identity, IdentityError> {
        let agents = self.catalogue(&current.region)?;
        let candidates: Vec<&String> = agents
            .iter()
            .filter(|ua| **ua != current.user_agent)
            .collect();

        let mut rng = rand::thread_rng();
        let user_agent = match candidates.choose(&mut rng) {
            Some(ua) => (*ua).clone(),
            // Single-entry catalogue: keep what we have
            None => current.user_agent.clone(),
        };

        Ok(current.with_user_agent(user_agent))
    }

    fn neighbours(&self, region: &str) -> Vec<String> {
        self.proximity.get(region).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_stays_in_region() {
        let policy = StaticIdentityPolicy::default();
        let identity = policy.generate("eu-west").await.unwrap();

        assert_eq!(identity.region, "eu-west");
        assert!(identity.endpoint.starts_with("eu-west-edge-"));
        assert!(policy.catalogue("eu-west").unwrap().contains(&identity.user_agent));
    }

    #[tokio::test]
    async fn test_unknown_region() {
        let policy = StaticIdentityPolicy::default();
        let err = policy.generate("moon-base").await.unwrap_err();
        assert_eq!(err, IdentityError::UnknownRegion("moon-base".to_string()));
        assert!(policy.neighbours("moon-base").is_empty());
    }

    #[tokio::test]
    async fn test_user_agent_rotation_keeps_endpoint() {
        let policy = StaticIdentityPolicy::default();
        let identity = policy.generate("us-east").await.unwrap();
        let rotated = policy.rotate_user_agent(&identity).await.unwrap();

        assert_eq!(rotated.region, identity.region);
        assert_eq!(rotated.endpoint, identity.endpoint);
        assert_ne!(rotated.user_agent, identity.user_agent);
    }

    #[test]
    fn test_every_neighbour_is_a_known_region() {
        let policy = StaticIdentityPolicy::default();
        for region in policy.regions() {
            let neighbours = policy.neighbours(region);
            assert!(!neighbours.is_empty(), "{} has no neighbours", region);
            for neighbour in neighbours {
                assert!(policy.catalogue(&neighbour).is_ok());
                assert_ne!(neighbour, region);
            }
        }
    }
}
