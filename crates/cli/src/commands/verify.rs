//! Verify Command

use std::path::PathBuf;

use anyhow::Result;
use atf_core::verify_run;
use clap::Args;
use serde::Serialize;

use crate::output::{self, print_list, print_success, OutputFormat, TableDisplay};
use crate::{EXIT_FAIL, EXIT_PASS};

#[derive(Args)]
pub struct VerifyArgs {
    /// Run directory (runs/<runId>)
    #[arg(short, long)]
    pub run: PathBuf,
}

#[derive(Serialize)]
struct FindingDisplay {
    file: String,
    finding: &'static str,
}

impl TableDisplay for FindingDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["FILE", "FINDING"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.file.clone(), self.finding.to_string()]
    }
}

pub async fn execute(args: VerifyArgs, format: OutputFormat) -> Result<i32> {
    let report = verify_run(&args.run).await?;

    if let OutputFormat::Json = format {
        output::print_json(&report);
    } else if report.is_intact() {
        print_success(&format!("{} is intact", args.run.display()));
    } else {
        let mut findings: Vec<FindingDisplay> = Vec::new();
        let groups = [
            (&report.mismatched, "modified"),
            (&report.missing, "missing"),
            (&report.unexpected, "unexpected"),
        ];
        for (files, finding) in groups {
            findings.extend(files.iter().map(|file| FindingDisplay {
                file: file.clone(),
                finding,
            }));
        }
        if !report.root_matches {
            findings.push(FindingDisplay {
                file: atf_core::manifest::MANIFEST_FILE.to_string(),
                finding: "root digest mismatch",
            });
        }
        print_list(&findings, format);
    }

    Ok(if report.is_intact() { EXIT_PASS } else { EXIT_FAIL })
}
