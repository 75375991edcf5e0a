//! Fleet Instance - one proxy instance and its collaborators
//!
//! An [`Instance`] is a stateful worker identity: it owns a connection table,
//! a rotating outbound identity and health metrics, and delegates the actual
//! fetch to a pluggable [`Renderer`].
//!
//! ## Lifecycle
//!
//! ```text
//! initializing -> ready <-> unhealthy
//! ready | unhealthy -> shutting_down -> shutdown
//! ```
//!
//! Per-instance timers (see the rotation/failover controller) rotate the
//! identity, swap user-agents and reclassify health independently.

#![deny(unsafe_code)]

pub mod collaborators;
pub mod config;
mod controller;
pub mod error;
pub mod events;
pub mod identity;
pub mod instance;
pub mod sampler;

pub use collaborators::{
    ContentValidator, FailingMetricsSink, FailingRenderer, MetricsSink, NoOpMetricsSink,
    RecordingMetricsSink, RenderError, RenderRequest, RenderedPage, Renderer, SchemeValidator,
    SinkError, StaticRenderer, Validation,
};
pub use config::InstanceConfig;
pub use error::{EmbedError, EmbedResult, IdentityError, InstanceError, InstanceResult};
pub use events::EventEmitter;
pub use identity::{IdentityPolicy, StaticIdentityPolicy};
pub use instance::{HealthReport, Instance, InstanceServices, PendingEmbed, RotationOutcome};
pub use sampler::{ConnectionLoadSampler, ResourceSampler};
