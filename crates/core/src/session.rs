//! Run sessions: one recorder, one executor, fail-fast step execution
//!
//! [`replay`] runs a whole trace. [`RunSession`] exposes the same lifecycle
//! one step at a time (`open`, `execute`, `close`) for compiled tests and the
//! explorer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map};
use tracing::{info, warn};

use crate::artifacts::{ArtifactRecorder, LogLevel, RunMode, RunVerdict, StepRecord};
use crate::browser::BrowserDriver;
use crate::config::EngineConfig;
use crate::contract::ContractValidator;
use crate::error::{Error, Result};
use crate::executor::{ExecutorOptions, TraceExecutor};
use crate::interpolation::seed_env;
use crate::trace::{Step, Trace};

/// Per-run overrides
#[derive(Default)]
pub struct SessionOptions {
    /// Overrides the trace's `policies.headless`
    pub headless: Option<bool>,
    /// Browser to use instead of the configured driver
    pub browser: Option<Box<dyn BrowserDriver>>,
    /// Contract to use instead of the one found under `contracts_dir`
    pub contract: Option<ContractValidator>,
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub verdict: RunVerdict,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
struct Failure {
    reason: String,
    step_id: Option<String>,
}

/// An open run
pub struct RunSession {
    recorder: Arc<ArtifactRecorder>,
    executor: TraceExecutor,
    records: Vec<StepRecord>,
    failure: Option<Failure>,
}

impl RunSession {
    /// Create the run namespace and prepare the executor.
    ///
    /// A setup failure (e.g. the browser cannot start) does not return an
    /// error: the session opens halted and its verdict will be `fail`.
    pub async fn open(
        trace: &Trace,
        mode: RunMode,
        config: &EngineConfig,
        options: SessionOptions,
    ) -> Result<Self> {
        let secrets: Vec<String> = seed_env(&trace.inputs.env).into_values().collect();
        let recorder = Arc::new(ArtifactRecorder::new(&config.runs_dir, trace, mode, secrets));
        recorder.init().await?;

        let contract = match options.contract {
            Some(contract) => Some(contract),
            None => load_contract(config, &trace.app),
        };

        let executor = TraceExecutor::new(
            trace,
            recorder.clone(),
            ExecutorOptions {
                ui: config.ui.clone(),
                headless: options.headless,
                contract,
                browser: options.browser,
            },
        )?;

        let mut session = Self {
            recorder,
            executor,
            records: Vec::new(),
            failure: None,
        };

        if let Err(e) = session.executor.setup().await {
            session.halt(format!("Session setup failed: {e}")).await;
        }

        info!(
            "Opened {} run {} for {}/{}",
            mode,
            session.run_id(),
            trace.app,
            trace.test_name
        );
        Ok(session)
    }

    pub fn run_id(&self) -> &str {
        self.recorder.run_id()
    }

    pub fn run_dir(&self) -> &Path {
        self.recorder.run_dir()
    }

    pub fn recorder(&self) -> &ArtifactRecorder {
        &self.recorder
    }

    pub fn executor(&self) -> &TraceExecutor {
        &self.executor
    }

    /// True once a step has failed or the run was halted
    pub fn is_halted(&self) -> bool {
        self.failure.is_some()
    }

    /// Stop the run with a reason not tied to a step
    pub async fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(e) = self.recorder.log(&reason, LogLevel::Error, Map::new()).await {
            warn!("Failed to log halt of run {}: {}", self.run_id(), e);
        }
        if self.failure.is_none() {
            self.failure = Some(Failure {
                reason,
                step_id: None,
            });
        }
    }

    /// Run one step and record it.
    ///
    /// A failing step is returned as a record with `status: fail`; after that
    /// the session refuses further steps.
    pub async fn execute(&mut self, step: &Step) -> Result<StepRecord> {
        if let Some(failure) = &self.failure {
            return Err(Error::RunHalted(failure.reason.clone()));
        }

        let record = self.executor.run_step(step).await;
        if let Err(e) = self.recorder.record_step(&record).await {
            self.failure = Some(Failure {
                reason: format!("Failed to record step {}: {}", step.id, e),
                step_id: Some(step.id.clone()),
            });
            return Err(e);
        }

        if !record.passed() {
            self.failure = Some(Failure {
                reason: record.reason(),
                step_id: Some(step.id.clone()),
            });
        }
        self.records.push(record.clone());
        Ok(record)
    }

    /// Tear down drivers and write the verdict
    pub async fn close(mut self) -> Result<RunOutcome> {
        if let Err(e) = self.executor.teardown().await {
            warn!("Teardown failed for run {}: {}", self.run_id(), e);
            if let Err(log_err) = self
                .recorder
                .log(
                    &format!("Teardown failed: {e}"),
                    LogLevel::Warn,
                    [("phase".to_string(), json!("teardown"))].into_iter().collect(),
                )
                .await
            {
                warn!("Failed to log teardown error: {}", log_err);
            }
        }

        let verdict = match self.failure.take() {
            Some(failure) => RunVerdict::fail(failure.reason, failure.step_id),
            None => RunVerdict::pass(),
        };
        self.recorder.finalize(&verdict).await?;

        Ok(RunOutcome {
            run_id: self.recorder.run_id().to_string(),
            run_dir: self.recorder.run_dir().to_path_buf(),
            verdict,
            steps: self.records,
        })
    }
}

fn load_contract(config: &EngineConfig, app: &str) -> Option<ContractValidator> {
    let path = config.contract_path(app)?;
    match ContractValidator::load(&path) {
        Ok(contract) => Some(contract),
        Err(e) => {
            warn!("Ignoring unreadable contract {}: {}", path.display(), e);
            None
        }
    }
}

/// Replay every step of a trace, stopping at the first failure.
///
/// Step failures are reported through the verdict; `Err` means the run
/// itself could not be carried out.
pub async fn replay(trace: &Trace, config: &EngineConfig, options: SessionOptions) -> Result<RunOutcome> {
    trace.validate()?;
    let mut session = RunSession::open(trace, RunMode::Replay, config, options).await?;

    let mut infra_error = None;
    for step in &trace.steps {
        if session.is_halted() {
            break;
        }
        if let Err(e) = session.execute(step).await {
            infra_error = Some(e);
            break;
        }
    }

    let outcome = session.close().await?;
    match infra_error {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

/// Load a trace file and replay it
pub async fn replay_file(path: &Path, config: &EngineConfig, options: SessionOptions) -> Result<RunOutcome> {
    let trace = Trace::from_file(path)?;
    replay(&trace, config, options).await
}
