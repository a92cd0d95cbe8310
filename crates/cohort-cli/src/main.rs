//! Cohort command-line interface
//!
//! Inspect the effective configuration and run an in-process partition to
//! watch master replicas move as members leave and rejoin.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{
    config::{handle_config_command, ConfigCommand},
    simulate::{handle_simulate_command, SimulateCommand},
};

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Cohort - partition-scoped high-availability coordination", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = "cohort.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config(ConfigCommand),

    /// Run HA services on an in-process partition and churn its membership
    Simulate(SimulateCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(&cli.config)?;
    match cli.command {
        Commands::Config(cmd) => handle_config_command(&cmd, &config)?,
        Commands::Simulate(cmd) => handle_simulate_command(&cmd, &config).await?,
    }

    Ok(())
}
