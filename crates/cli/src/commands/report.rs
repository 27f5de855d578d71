//! Report Command

use std::path::PathBuf;

use anyhow::Result;
use atf_core::report::SUMMARY_HTML;
use atf_core::{generate_report, EngineConfig, Status};
use clap::Args;

use crate::output::{self, print_success, status_badge, OutputFormat};
use crate::{EXIT_FAIL, EXIT_PASS};

#[derive(Args)]
pub struct ReportArgs {
    /// Run directory, or a run id under the configured runs directory
    #[arg(short, long)]
    pub run: PathBuf,
}

pub async fn execute(args: ReportArgs, config: &EngineConfig, format: OutputFormat) -> Result<i32> {
    let run_dir = if args.run.is_dir() {
        args.run
    } else {
        config.runs_dir.join(&args.run)
    };
    let summary = generate_report(&run_dir).await?;
    let passed = summary.verdict == Status::Pass;

    match format {
        OutputFormat::Json => output::print_json(&summary),
        OutputFormat::Table => {
            println!(
                "{} run {}: {} step(s), {}ms",
                status_badge(passed),
                summary.run_id,
                summary.total_steps,
                summary.duration_ms
            );
            for step in &summary.failed_steps {
                println!("  {}: {}", step.step_id, step.error.as_deref().unwrap_or("failed"));
            }
            print_success(&format!("Report written to {}", run_dir.join(SUMMARY_HTML).display()));
        }
    }

    Ok(if passed { EXIT_PASS } else { EXIT_FAIL })
}
