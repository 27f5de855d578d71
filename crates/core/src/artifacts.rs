//! Per-run evidence: step log, structured log, artifacts and verdict
//!
//! Layout under `<runs_dir>/<run_id>/`:
//!
//! ```text
//! run.json        run metadata, rewritten once at finalize
//! steps.jsonl     one StepRecord per line
//! logs.jsonl      structured log lines
//! verdict.json    written exactly once
//! summary.json    run summary, plus summary.html
//! manifest.json   SHA-256 of every other file
//! ui/             screenshots
//! api/            HTTP exchanges
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::browser::BrowserDriver;
use crate::error::{Error, FailureKind, Result};
use crate::http::HttpExchange;
use crate::manifest::RunManifest;
use crate::redaction::Redactor;
use crate::report::generate_report;
use crate::trace::{Action, Trace, TraceKind};

/// How a run was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Replay,
    Compiled,
    Explore,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Replay => "replay",
            RunMode::Compiled => "compiled",
            RunMode::Explore => "explore",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
}

/// Outcome of one step, all attempts included
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_id: String,
    pub action: Action,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Resolved target
    pub selector_or_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guards: Option<Value>,
    /// Artifact kind ("screenshot", "api") to path relative to the run dir
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl StepRecord {
    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }

    /// Failure reason for the verdict
    pub fn reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("Step {} failed", self.step_id))
    }
}

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunVerdict {
    pub status: Status,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
}

impl RunVerdict {
    pub fn pass() -> Self {
        Self {
            status: Status::Pass,
            reasons: Vec::new(),
            failed_step_id: None,
        }
    }

    pub fn fail(reason: impl Into<String>, failed_step_id: Option<String>) -> Self {
        Self {
            status: Status::Fail,
            reasons: vec![reason.into()],
            failed_step_id,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == Status::Pass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
struct TraceIdentity {
    app: String,
    test_name: String,
    kind: TraceKind,
    base_url: String,
    api_base_url: String,
}

/// Owns the evidence directory of one run
#[derive(Debug)]
pub struct ArtifactRecorder {
    run_id: String,
    run_dir: PathBuf,
    mode: RunMode,
    trace: TraceIdentity,
    started_at: DateTime<Utc>,
    redactor: Redactor,
    finalized: AtomicBool,
}

/// `<mode>_<epoch millis>_<6 hex chars>`
pub fn new_run_id(mode: RunMode) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", mode, Utc::now().timestamp_millis(), &suffix[..6])
}

impl ArtifactRecorder {
    pub fn new<I, S>(runs_dir: &Path, trace: &Trace, mode: RunMode, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let run_id = new_run_id(mode);
        Self {
            run_dir: runs_dir.join(&run_id),
            run_id,
            mode,
            trace: TraceIdentity {
                app: trace.app.clone(),
                test_name: trace.test_name.clone(),
                kind: trace.kind,
                base_url: trace.base_url.clone(),
                api_base_url: trace.api_base_url.clone(),
            },
            started_at: Utc::now(),
            redactor: Redactor::new(secrets),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Create the run namespace and write initial metadata
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.run_dir.join("ui")).await?;
        fs::create_dir_all(self.run_dir.join("api")).await?;
        fs::write(self.run_dir.join("steps.jsonl"), b"").await?;
        fs::write(self.run_dir.join("logs.jsonl"), b"").await?;

        let metadata = json!({
            "runId": self.run_id,
            "mode": self.mode,
            "trace": self.trace_json(),
            "startedAt": self.started_at,
            "baseUrl": self.trace.base_url,
            "apiBaseUrl": self.trace.api_base_url,
        });
        fs::write(self.run_dir.join("run.json"), serde_json::to_vec_pretty(&metadata)?).await?;

        info!("Recording run {} in {}", self.run_id, self.run_dir.display());
        Ok(())
    }

    fn trace_json(&self) -> Value {
        json!({
            "app": self.trace.app,
            "testName": self.trace.test_name,
            "type": self.trace.kind,
        })
    }

    async fn append_line(&self, file: &str, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut handle = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.run_dir.join(file))
            .await?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        Ok(())
    }

    /// Append a step record to `steps.jsonl`
    pub async fn record_step(&self, record: &StepRecord) -> Result<()> {
        let value = self.redactor.redact_value(&serde_json::to_value(record)?);
        self.append_line("steps.jsonl", &value).await
    }

    /// Append a structured line to `logs.jsonl` and emit it as a tracing event
    pub async fn log(&self, message: &str, level: LogLevel, fields: Map<String, Value>) -> Result<()> {
        let message = self.redactor.redact_str(message);
        match level {
            LogLevel::Debug => debug!(run_id = %self.run_id, "{}", message),
            LogLevel::Info => info!(run_id = %self.run_id, "{}", message),
            LogLevel::Warn => warn!(run_id = %self.run_id, "{}", message),
            LogLevel::Error => error!(run_id = %self.run_id, "{}", message),
        }

        let mut line = Map::new();
        line.insert("timestamp".to_string(), json!(Utc::now()));
        line.insert("level".to_string(), json!(level));
        line.insert("message".to_string(), Value::String(message));
        for (k, v) in fields {
            line.entry(k).or_insert(v);
        }
        let line = self.redactor.redact_value(&Value::Object(line));
        self.append_line("logs.jsonl", &line).await
    }

    /// Capture the browser into `ui/<step>-<millis>.png`
    pub async fn save_ui_screenshot(&self, step_id: &str, driver: &dyn BrowserDriver) -> Result<String> {
        let relative = format!("ui/{}-{}.png", step_id, Utc::now().timestamp_millis());
        driver.screenshot(&self.run_dir.join(&relative)).await?;
        Ok(relative)
    }

    /// Persist a redacted exchange as `api/<step>-<millis>.json`
    pub async fn save_api_exchange(&self, step_id: &str, exchange: &HttpExchange) -> Result<String> {
        let relative = format!("api/{}-{}.json", step_id, Utc::now().timestamp_millis());
        let payload = json!({
            "request": {
                "method": exchange.request.method,
                "path": self.redactor.redact_str(&exchange.request.path),
                "headers": self.redactor.redact_headers(&exchange.request.headers),
                "body": exchange.request.body.as_ref().map(|b| self.redactor.redact_value(b)),
            },
            "response": {
                "status": exchange.status,
                "headers": self.redactor.redact_headers(&exchange.headers),
                "body": self.redactor.redact_value(&exchange.body),
                "durationMs": exchange.duration_ms,
                "url": self.redactor.redact_str(&exchange.url),
            }
        });
        fs::write(self.run_dir.join(&relative), serde_json::to_vec_pretty(&payload)?).await?;
        Ok(relative)
    }

    /// Write the verdict (once), final run metadata and the manifest
    pub async fn finalize(&self, verdict: &RunVerdict) -> Result<()> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyFinalized(self.run_id.clone()));
        }

        let verdict_json = self.redactor.redact_value(&serde_json::to_value(verdict)?);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.run_dir.join("verdict.json"))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyFinalized(self.run_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&serde_json::to_vec_pretty(&verdict_json)?).await?;
        file.flush().await?;

        let metadata = json!({
            "runId": self.run_id,
            "mode": self.mode,
            "trace": self.trace_json(),
            "startedAt": self.started_at,
            "finishedAt": Utc::now(),
            "verdict": verdict_json,
            "artifacts": {
                "steps": "steps.jsonl",
                "logs": "logs.jsonl",
            }
        });
        fs::write(self.run_dir.join("run.json"), serde_json::to_vec_pretty(&metadata)?).await?;

        if let Err(e) = generate_report(&self.run_dir).await {
            warn!("Failed to write report for run {}: {}", self.run_id, e);
        }

        RunManifest::compute(&self.run_dir)
            .await?
            .write(&self.run_dir)
            .await?;

        info!("Run {} finished: {:?}", self.run_id, verdict.status);
        Ok(())
    }
}
