//! otokit - arcade score sync
//!
//! Main entry point for the otokit CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{config, prepare, run};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// otokit - sync arcade scores to community leaderboards
#[derive(Parser)]
#[command(name = "otokit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output events as JSON lines (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Use this config file instead of the discovered ones
    #[arg(long, global = true, env = "OTOKIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one score sync
    Run(run::RunArgs),

    /// Check whether the tunnel interface can be created
    Prepare(prepare::PrepareArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "otokit=debug,otokit_sync=debug,otokit_tunnel=debug,otokit_oauth=debug,otokit_config=debug,info"
    } else {
        "otokit=info,otokit_sync=info,otokit_tunnel=info,otokit_oauth=info,warn"
    };

    let log_dir = otokit_config::user_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "otokit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "otokit=trace,otokit_sync=trace,otokit_tunnel=trace,otokit_oauth=trace,otokit_config=trace,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_path: cli.config,
    };

    match cli.command {
        Commands::Run(args) => run::run(args, &ctx).await,
        Commands::Prepare(args) => prepare::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}
