//! Driftnet CLI - Command-line interface
//!
//! Runs the tracker service and peer roles from the command line.

mod commands;

use clap::Parser;
use driftnet_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "driftnet")]
#[command(about = "Piece-based file distribution over a tracker-coordinated swarm")]
struct Cli {
    /// Console log level; full debug logs always land in logs/
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    commands::handle_command(cli.command).await
}
