//! Simulated renderer and log-backed metrics sink used by fleetd

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fleet_instance::{MetricsSink, RenderError, RenderRequest, RenderedPage, Renderer, SinkError};
use fleet_types::{ConnectionInfo, EventSeverity, FleetEventEnvelope, SessionCommand};
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use crate::config::SimulationConfig;

/// Renderer that sleeps for a random latency and fails at a fixed rate.
#[derive(Debug, Clone)]
pub struct SimulatedRenderer {
    min_latency: Duration,
    max_latency: Duration,
    failure_rate: f64,
}

impl SimulatedRenderer {
    pub fn new(config: &SimulationConfig) -> Self {
        let min = config.min_latency_ms.min(config.max_latency_ms);
        let max = config.min_latency_ms.max(config.max_latency_ms);
        Self {
            min_latency: Duration::from_millis(min),
            max_latency: Duration::from_millis(max),
            failure_rate: config.failure_rate.max(0.0).min(1.0),
        }
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let latency = if self.max_latency > self.min_latency {
            rng.gen_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        };
        (latency, rng.gen_bool(self.failure_rate))
    }
}

#[async_trait]
impl Renderer for SimulatedRenderer {
    async fn fetch(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        let (latency, fail) = self.roll();
        tokio::time::sleep(latency).await;

        if fail {
            return Err(RenderError::Fetch(format!(
                "simulated upstream failure for {}",
                request.target
            )));
        }

        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), request.identity.region.clone());
        metadata.insert("user_agent".to_string(), request.identity.user_agent.clone());
        metadata.insert("latency_ms".to_string(), latency.as_millis().to_string());

        Ok(RenderedPage {
            content: format!(
                "<iframe src=\"{}\" data-attempt=\"{}\"></iframe>",
                request.target, request.attempt
            ),
            metadata,
        })
    }

    async fn execute_command(
        &self,
        connection: &ConnectionInfo,
        command: &SessionCommand,
    ) -> Result<(), RenderError> {
        debug!(url = %connection.target, command = %command.name, "Simulated command delivered");
        Ok(())
    }
}

/// Sink that writes every fleet event to the log at its severity.
#[derive(Debug, Default)]
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn emit(&self, envelope: &FleetEventEnvelope) -> Result<(), SinkError> {
        let kind = envelope.event.kind();
        let source = &envelope.source;
        let event = &envelope.event;
        match envelope.severity {
            EventSeverity::Debug => trace!(kind, ?source, ?event, "Fleet event"),
            EventSeverity::Info => info!(kind, ?source, "Fleet event"),
            EventSeverity::Warning => warn!(kind, ?source, ?event, "Fleet event"),
            EventSeverity::Error => error!(kind, ?source, ?event, "Fleet event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::{EmbedOptions, Identity};

    fn request() -> RenderRequest {
        RenderRequest {
            target: "https://example.com".to_string(),
            identity: Identity::new("us-east", "ua", "edge"),
            options: EmbedOptions::default(),
            attempt: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_fails_at_zero_rate() {
        let renderer = SimulatedRenderer::new(&SimulationConfig {
            min_latency_ms: 5,
            max_latency_ms: 10,
            failure_rate: 0.0,
        });
        for _ in 0..20 {
            let page = renderer.fetch(&request()).await.unwrap();
            assert!(page.content.contains("https://example.com"));
            let latency: u64 = page.metadata["latency_ms"].parse().unwrap();
            assert!((5..=10).contains(&latency));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_fails_at_full_rate() {
        let renderer = SimulatedRenderer::new(&SimulationConfig {
            min_latency_ms: 0,
            max_latency_ms: 0,
            failure_rate: 1.0,
        });
        assert!(matches!(
            renderer.fetch(&request()).await,
            Err(RenderError::Fetch(_))
        ));
    }

    #[test]
    fn test_inverted_bounds_are_swapped() {
        let renderer = SimulatedRenderer::new(&SimulationConfig {
            min_latency_ms: 50,
            max_latency_ms: 10,
            failure_rate: 3.0,
        });
        assert_eq!(renderer.min_latency, Duration::from_millis(10));
        assert_eq!(renderer.max_latency, Duration::from_millis(50));
        assert_eq!(renderer.failure_rate, 1.0);
    }
}
