//! ATF CLI - Main Entry Point
//!
//! Replays recorded traces, explores new ones with an LLM, checks the
//! integrity of recorded runs and summarizes them.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;

use atf_core::EngineConfig;
use commands::{explore, list, replay, report, verify};

/// Exit code for a passing run
pub const EXIT_PASS: i32 = 0;
/// Exit code for a failing verdict or a tampered run
pub const EXIT_FAIL: i32 = 1;
/// Exit code when the command itself could not run
pub const EXIT_ERROR: i32 = 2;

/// ATF - record, replay and explore UI/API test traces
#[derive(Parser)]
#[command(name = "atf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "atf.toml", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a recorded trace
    Replay(replay::ReplayArgs),

    /// Let an LLM discover a new trace toward a goal
    Explore(explore::ExploreArgs),

    /// Check a run directory against its manifest
    Verify(verify::VerifyArgs),

    /// Write summary.json and summary.html for a finished run
    Report(report::ReportArgs),

    /// List apps or traces
    #[command(subcommand)]
    List(list::ListCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = EngineConfig::load(&cli.config)?;
    config.apply_env()?;

    match cli.command {
        Commands::Replay(args) => replay::execute(args, &config, cli.format).await,
        Commands::Explore(args) => explore::execute(args, config, cli.format).await,
        Commands::Verify(args) => verify::execute(args, cli.format).await,
        Commands::Report(args) => report::execute(args, &config, cli.format).await,
        Commands::List(cmd) => list::execute(cmd, &config, cli.format),
    }
}
