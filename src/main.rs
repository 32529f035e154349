//! CLI Entry Point for fastcs
//!
//! Provides command-line interface for:
//! - Serving the demo temperature controller
//! - Running the simulated temperature controller device
//!
//! # Usage
//!
//! Start a simulator, then serve a controller against it:
//! ```bash
//! fastcs simulate --port 25565 --ramps 4
//! fastcs run --config config/demo.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fastcs::config::LaunchConfig;
use fastcs::demo::simulation::{Simulator, SimulatorSettings};
use fastcs::demo::{TemperatureController, TemperatureControllerSettings};
use fastcs::logging::{self, TracingConfig};
use fastcs_core::Backend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "fastcs")]
#[command(about = "Control-system-agnostic device driver runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo temperature controller until Ctrl-C
    Run {
        /// TOML launch configuration; defaults and FASTCS_ variables apply without one
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the simulated temperature controller device
    Simulate {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "25565")]
        port: u16,

        /// Number of ramp channels
        #[arg(long, default_value = "4")]
        ramps: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Everything shares one single-threaded loop
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            Commands::Run { config } => run_controller(config).await,
            Commands::Simulate { host, port, ramps } => run_simulator(host, port, ramps).await,
        }
    })
}

async fn run_controller(config_path: Option<PathBuf>) -> Result<()> {
    let config = match &config_path {
        Some(path) => LaunchConfig::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => LaunchConfig::load()?,
    };
    config.validate()?;
    logging::init_from_config(&config)?;

    info!(
        name = %config.application.name,
        device = %config.controller.address(),
        ramps = config.controller.num_ramp_controllers,
        "Starting controller"
    );

    let controller = TemperatureController::new(TemperatureControllerSettings::from(
        &config.controller,
    ))?;
    let backend = Backend::from_current(Arc::new(controller))?.with_config(config.backend_config());

    spawn_ctrl_c(backend.shutdown_handle());
    backend.run().await?;
    Ok(())
}

async fn run_simulator(host: String, port: u16, ramps: usize) -> Result<()> {
    logging::init(TracingConfig::new(Level::INFO))?;
    anyhow::ensure!(
        (1..=99).contains(&ramps),
        "ramps must be between 1 and 99, got {ramps}"
    );

    let simulator = Simulator::bind(&format!("{host}:{port}"), SimulatorSettings::new(ramps))
        .await
        .with_context(|| format!("Failed to bind {host}:{port}"))?;

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());
    simulator.run(shutdown).await?;
    Ok(())
}

fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        token.cancel();
    });
}
