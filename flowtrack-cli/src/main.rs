//! ## flowtrack-cli
//! **`flowtrack` command line**
//!
//! Drives the flow engine with synthetic traffic and inspects the resolved
//! configuration.

use anyhow::Context;
use clap::Parser;
use flowtrack_config::FlowtrackConfig;
use flowtrack_telemetry::logging::EventLogger;

mod commands;
mod simulate;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FlowtrackConfig::load_from_path(path),
        None => FlowtrackConfig::load(),
    }
    .context("Failed to load configuration")?;

    EventLogger::init(&config.telemetry.log_level).context("Failed to install log subscriber")?;

    match cli.command {
        Commands::Simulate(args) => commands::run_simulation(args, &config).await,
        Commands::CheckConfig => commands::check_config(&config),
    }
}
