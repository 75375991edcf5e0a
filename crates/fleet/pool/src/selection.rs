//! Load-balanced instance selection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_instance::Instance;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Instance selection strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Fewest active connections; ties go to the oldest instance
    #[default]
    LeastConnections,

    /// Lowest rolling-average latency
    FastestResponse,

    /// Global request counter modulo the candidate count
    RoundRobin,

    /// Uniformly random candidate
    Random,
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionStrategy::LeastConnections => write!(f, "least-connections"),
            SelectionStrategy::FastestResponse => write!(f, "fastest-response"),
            SelectionStrategy::RoundRobin => write!(f, "round-robin"),
            SelectionStrategy::Random => write!(f, "random"),
        }
    }
}

/// Pick one of `instances` (in pool order) that is ready and below its
/// connection limit.
pub(crate) fn select(
    strategy: SelectionStrategy,
    instances: &[Arc<Instance>],
    counter: &AtomicU64,
) -> Option<Arc<Instance>> {
    let candidates: Vec<&Arc<Instance>> = instances.iter().filter(|i| i.is_available()).collect();
    if candidates.is_empty() {
        return None;
    }

    let chosen = match strategy {
        SelectionStrategy::LeastConnections => candidates
            .iter()
            .min_by_key(|i| i.active_connections())
            .copied(),
        SelectionStrategy::FastestResponse => candidates
            .iter()
            .min_by(|a, b| {
                a.avg_latency_ms()
                    .partial_cmp(&b.avg_latency_ms())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied(),
        SelectionStrategy::RoundRobin => {
            let idx = counter.fetch_add(1, Ordering::SeqCst) as usize;
            candidates.get(idx % candidates.len()).copied()
        }
        SelectionStrategy::Random => candidates.choose(&mut rand::thread_rng()).copied(),
    };

    chosen.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_instance::{InstanceConfig, InstanceServices, StaticRenderer};
    use fleet_types::EmbedOptions;

    async fn ready(count: usize) -> Vec<Arc<Instance>> {
        let services = InstanceServices::new(Arc::new(StaticRenderer::new()));
        let mut instances = Vec::new();
        for _ in 0..count {
            let instance = Instance::create(InstanceConfig::manual(), services.clone())
                .await
                .unwrap();
            instance.initialize().unwrap();
            instances.push(instance);
        }
        instances
    }

    #[tokio::test]
    async fn test_least_connections_ties_go_to_first() {
        let instances = ready(3).await;
        let counter = AtomicU64::new(0);

        let chosen = select(SelectionStrategy::LeastConnections, &instances, &counter).unwrap();
        assert_eq!(chosen.id(), instances[0].id());

        let _busy = instances[0]
            .begin_embed("https://a.example", EmbedOptions::default(), None)
            .unwrap();
        let chosen = select(SelectionStrategy::LeastConnections, &instances, &counter).unwrap();
        assert_eq!(chosen.id(), instances[1].id());
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let instances = ready(3).await;
        let counter = AtomicU64::new(0);

        let picks: Vec<_> = (0..6)
            .map(|_| {
                select(SelectionStrategy::RoundRobin, &instances, &counter)
                    .unwrap()
                    .id()
            })
            .collect();

        assert_eq!(picks[0], instances[0].id());
        assert_eq!(picks[1], instances[1].id());
        assert_eq!(picks[2], instances[2].id());
        assert_eq!(picks[3], instances[0].id());
    }

    #[tokio::test]
    async fn test_no_ready_instance() {
        let instances = ready(2).await;
        for instance in &instances {
            instance.shutdown();
        }
        let counter = AtomicU64::new(0);

        for strategy in [
            SelectionStrategy::LeastConnections,
            SelectionStrategy::FastestResponse,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::Random,
        ] {
            assert!(select(strategy, &instances, &counter).is_none());
        }
    }
}
