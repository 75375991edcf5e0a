//! External collaborators the fleet calls into.
//!
//! The fetch/render implementation, content validation and metrics export
//! live outside the fleet; instances and the scheduler only see these traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_types::{ConnectionInfo, EmbedOptions, FleetEventEnvelope, Identity, SessionCommand};
use thiserror::Error;
use tracing::debug;

/// One fetch attempt issued by an instance.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub target: String,
    pub identity: Identity,
    pub options: EmbedOptions,
    /// 1-based attempt number inside the instance
    pub attempt: u32,
}

/// Content produced by the renderer.
#[derive(Debug, Clone, Default)]
pub struct RenderedPage {
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// Renderer failures.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Performs the actual network fetch and render.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Called once per embed attempt.
    async fn fetch(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError>;

    /// Deliver a live command to an in-flight connection.
    async fn execute_command(
        &self,
        _connection: &ConnectionInfo,
        command: &SessionCommand,
    ) -> Result<(), RenderError> {
        Err(RenderError::Unsupported(command.name.clone()))
    }
}

/// Renderer that answers every fetch with a canned page.
#[derive(Debug, Default)]
pub struct StaticRenderer {
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for StaticRenderer {
    async fn fetch(&self, request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut metadata = HashMap::new();
        metadata.insert("region".to_string(), request.identity.region.clone());
        metadata.insert("endpoint".to_string(), request.identity.endpoint.clone());

        Ok(RenderedPage {
            content: format!("<embed src=\"{}\"></embed>", request.target),
            metadata,
        })
    }

    async fn execute_command(
        &self,
        connection: &ConnectionInfo,
        command: &SessionCommand,
    ) -> Result<(), RenderError> {
        debug!(url = %connection.target, command = %command.name, "Static renderer accepted command");
        Ok(())
    }
}

/// Renderer that fails every fetch.
#[derive(Debug)]
pub struct FailingRenderer {
    reason: String,
    calls: AtomicUsize,
}

impl FailingRenderer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fetch attempts received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for FailingRenderer {
    async fn fetch(&self, _request: &RenderRequest) -> Result<RenderedPage, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RenderError::Fetch(self.reason.clone()))
    }
}

/// Outcome of a pre-flight content check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub ok: bool,
    pub reason: Option<String>,
}

impl Validation {
    pub fn accept() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Optional pre-flight check run before a job is dispatched.
pub trait ContentValidator: Send + Sync {
    fn validate(&self, target: &str) -> Validation;
}

/// Accepts targets whose scheme is in an allow-list.
#[derive(Debug, Clone)]
pub struct SchemeValidator {
    allowed: Vec<String>,
}

impl SchemeValidator {
    pub fn new(allowed: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for SchemeValidator {
    fn default() -> Self {
        Self::new(["http", "https"])
    }
}

impl ContentValidator for SchemeValidator {
    fn validate(&self, target: &str) -> Validation {
        match target.split_once("://") {
            Some((scheme, rest)) if !rest.is_empty() => {
                if self.allowed.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
                    Validation::accept()
                } else {
                    Validation::reject(format!("scheme '{}' not allowed", scheme))
                }
            }
            _ => Validation::reject("target is not an absolute URL"),
        }
    }
}

/// Metrics sink failure. Never affects job outcome.
#[derive(Debug, Clone, Error)]
#[error("metrics sink error: {0}")]
pub struct SinkError(pub String);

/// Consumes lifecycle, health and metrics events.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, envelope: &FleetEventEnvelope) -> Result<(), SinkError>;
}

/// Sink that drops everything.
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn emit(&self, _envelope: &FleetEventEnvelope) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that rejects every event.
pub struct FailingMetricsSink;

impl MetricsSink for FailingMetricsSink {
    fn emit(&self, envelope: &FleetEventEnvelope) -> Result<(), SinkError> {
        Err(SinkError(format!("rejected {}", envelope.event.kind())))
    }
}

/// Sink that keeps every event in memory.
#[derive(Default)]
pub struct RecordingMetricsSink {
    events: Mutex<Vec<FleetEventEnvelope>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEventEnvelope> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events of one kind.
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event.kind() == kind)
            .count()
    }
}

impl MetricsSink for RecordingMetricsSink {
    fn emit(&self, envelope: &FleetEventEnvelope) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_validator() {
        let validator = SchemeValidator::default();
        assert!(validator.validate("https://example.com").ok);
        assert!(validator.validate("HTTP://example.com/a").ok);

        let rejected = validator.validate("ftp://example.com");
        assert!(!rejected.ok);
        assert!(rejected.reason.unwrap().contains("ftp"));

        assert!(!validator.validate("example.com").ok);
        assert!(!validator.validate("https://").ok);
    }

    #[tokio::test]
    async fn test_failing_renderer_counts_calls() {
        let renderer = FailingRenderer::new("boom");
        let request = RenderRequest {
            target: "https://example.com".to_string(),
            identity: Identity::new("us-east", "ua", "edge"),
            options: EmbedOptions::default(),
            attempt: 1,
        };

        assert!(renderer.fetch(&request).await.is_err());
        assert!(renderer.fetch(&request).await.is_err());
        assert_eq!(renderer.calls(), 2);
    }
}
