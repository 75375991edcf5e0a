//! Fleet daemon library
//!
//! Building blocks of `fleetd`:
//! - Layered configuration (defaults, file, environment)
//! - Simulated renderer and log-backed metrics sink
//! - Submission, progress and reporting flow

pub mod config;
pub mod error;
pub mod runner;
pub mod simulation;

pub use config::{FleetConfig, LoggingConfig, SimulationConfig, SubmitConfig};
pub use error::{DaemonError, DaemonResult};
pub use runner::{build_engine, read_targets, run_batch, RunReport};
pub use simulation::{LoggingMetricsSink, SimulatedRenderer};
