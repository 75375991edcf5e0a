//! Fleet Daemon - embedding job dispatcher
//!
//! `fleetd` starts an instance pool and a job engine, submits a list of
//! targets, logs the event stream and progress while the batch runs, and
//! prints the batch, shard and system status as JSON once it settles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_daemon::{build_engine, read_targets, run_batch, FleetConfig, SimulatedRenderer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fleet Daemon CLI
#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet Daemon - dispatch embedding jobs across a rotating instance pool", long_about = None)]
#[command(version)]
struct Cli {
    /// Targets to embed
    targets: Vec<String>,

    /// File with one target per line
    #[arg(short, long, env = "FLEET_TARGETS_FILE")]
    file: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<String>,

    /// Shard count of a massive submission
    #[arg(long)]
    shards: Option<usize>,

    /// Priority bucket of a regular submission (0 is served first)
    #[arg(short, long)]
    priority: Option<u8>,

    /// Retries per job
    #[arg(long)]
    max_retries: Option<u32>,

    /// Simulated fetch latency bounds in milliseconds, as MIN,MAX
    #[arg(long, value_delimiter = ',', num_args = 2)]
    latency_ms: Option<Vec<u64>>,

    /// Simulated fetch failure rate in [0, 1]
    #[arg(long)]
    failure_rate: Option<f64>,

    /// Log level
    #[arg(long, env = "FLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FLEET_LOG_JSON")]
    json: bool,
}

impl Cli {
    fn apply(&self, config: &mut FleetConfig) {
        if let Some(shards) = self.shards {
            config.scheduler.shard_count = shards;
        }
        if let Some(priority) = self.priority {
            config.submit.priority = priority;
        }
        if self.max_retries.is_some() {
            config.submit.max_retries = self.max_retries;
        }
        if let Some([min, max]) = self.latency_ms.as_deref() {
            config.simulation.min_latency_ms = *min;
            config.simulation.max_latency_ms = *max;
        }
        if let Some(rate) = self.failure_rate {
            config.simulation.failure_rate = rate;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = FleetConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let jobs = read_targets(&cli.targets, cli.file.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = jobs.len(),
        instances = config.pool.instances_per_node,
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "Starting fleetd"
    );

    let renderer = Arc::new(SimulatedRenderer::new(&config.simulation));
    let engine = build_engine(&config, renderer);
    engine.start().await?;

    let outcome = tokio::select! {
        outcome = run_batch(&engine, jobs, &config.submit) => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            None
        }
    };

    engine.shutdown(config.pool.shutdown_grace()).await;

    if let Some(outcome) = outcome {
        let report = outcome?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
