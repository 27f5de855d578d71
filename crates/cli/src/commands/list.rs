//! List Commands

use anyhow::Result;
use atf_core::{EngineConfig, Trace};
use clap::Subcommand;
use serde::Serialize;

use crate::output::{print_list, OutputFormat, TableDisplay};
use crate::EXIT_PASS;

#[derive(Subcommand)]
pub enum ListCommands {
    /// Apps that have recorded traces
    Apps,

    /// Traces recorded for an app
    Traces {
        /// App name
        #[arg(long)]
        app: String,
    },
}

#[derive(Serialize)]
struct AppDisplay {
    app: String,
    traces: usize,
}

impl TableDisplay for AppDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["APP", "TRACES"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.app.clone(), self.traces.to_string()]
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceDisplay {
    test_name: String,
    kind: String,
    steps: usize,
    path: String,
}

impl TableDisplay for TraceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["TEST", "TYPE", "STEPS", "PATH"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.test_name.clone(),
            self.kind.clone(),
            self.steps.to_string(),
            self.path.clone(),
        ]
    }
}

pub fn execute(cmd: ListCommands, config: &EngineConfig, format: OutputFormat) -> Result<i32> {
    match cmd {
        ListCommands::Apps => {
            let mut apps = Vec::new();
            if config.traces_dir.is_dir() {
                for entry in std::fs::read_dir(&config.traces_dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let app = entry.file_name().to_string_lossy().into_owned();
                    let traces = Trace::list(&config.traces_dir, &app)?.len();
                    apps.push(AppDisplay { app, traces });
                }
            }
            apps.sort_by(|a, b| a.app.cmp(&b.app));
            print_list(&apps, format);
        }
        ListCommands::Traces { app } => {
            let mut traces = Vec::new();
            for path in Trace::list(&config.traces_dir, &app)? {
                let display = match Trace::from_file(&path) {
                    Ok(trace) => TraceDisplay {
                        test_name: trace.test_name,
                        kind: format!("{:?}", trace.kind).to_lowercase(),
                        steps: trace.steps.len(),
                        path: path.display().to_string(),
                    },
                    Err(e) => {
                        tracing::warn!("Skipping unreadable trace {}: {}", path.display(), e);
                        continue;
                    }
                };
                traces.push(display);
            }
            print_list(&traces, format);
        }
    }
    Ok(EXIT_PASS)
}
