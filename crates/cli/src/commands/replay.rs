//! Replay Command

use std::path::PathBuf;

use anyhow::{Context, Result};
use atf_core::{replay_file, EngineConfig, RunOutcome, SessionOptions};
use clap::Args;
use serde_json::json;

use super::StepDisplay;
use crate::output::{self, print_list, status_badge, OutputFormat};
use crate::{EXIT_FAIL, EXIT_PASS};

#[derive(Args)]
pub struct ReplayArgs {
    /// Trace file to replay
    #[arg(short, long)]
    pub trace: PathBuf,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,
}

pub async fn execute(args: ReplayArgs, config: &EngineConfig, format: OutputFormat) -> Result<i32> {
    let options = SessionOptions {
        headless: args.headed.then_some(false),
        ..Default::default()
    };

    let outcome = replay_file(&args.trace, config, options)
        .await
        .with_context(|| format!("replay of {} failed", args.trace.display()))?;

    print_outcome(&outcome, format);
    Ok(if outcome.verdict.passed() { EXIT_PASS } else { EXIT_FAIL })
}

/// Print step records and the verdict of a finished run
pub fn print_outcome(outcome: &RunOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Json => output::print_json(&json!({
            "runId": outcome.run_id,
            "runDir": outcome.run_dir,
            "verdict": outcome.verdict,
            "steps": outcome.steps,
        })),
        OutputFormat::Table => {
            let steps: Vec<StepDisplay> = outcome.steps.iter().map(StepDisplay::from).collect();
            print_list(&steps, format);
            println!(
                "{} run {} ({})",
                status_badge(outcome.verdict.passed()),
                outcome.run_id,
                outcome.run_dir.display()
            );
            for reason in &outcome.verdict.reasons {
                println!("  {reason}");
            }
        }
    }
}
