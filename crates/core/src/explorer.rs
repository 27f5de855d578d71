//! Goal-driven exploration
//!
//! The explorer asks a [`LanguageModel`] for one step at a time, runs each
//! accepted step through a [`RunSession`] and keeps the steps that ran as a
//! new trace. The loop moves through `observing -> proposing -> executing`
//! until the model signals stop, the step budget runs out or something fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::artifacts::RunMode;
use crate::browser::{BrowserDriver, ElementSummary};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::llm::LanguageModel;
use crate::session::{RunOutcome, RunSession, SessionOptions};
use crate::trace::{
    Action, Generator, Guards, OneOrMany, Policies, Step, Trace, TraceInputs, TraceKind,
    TRACE_VERSION,
};

/// Proposal attempts per step before giving up
pub const PROPOSAL_ATTEMPTS: usize = 3;

/// Elements reported in a UI observation
pub const OBSERVED_ELEMENTS: usize = 15;

/// Executed steps shown back to the model
const RECENT_STEPS: usize = 3;

const STOP_ACTION: &str = "stop";

/// Turns a finished trace into a standalone test
#[async_trait]
pub trait TraceCompiler: Send + Sync {
    /// Write the compiled test under `out_dir` and return its path
    async fn compile(&self, trace: &Trace, out_dir: &Path) -> Result<PathBuf>;
}

/// What to explore
#[derive(Debug, Clone)]
pub struct ExplorerOptions {
    pub app: String,
    pub test_name: String,
    pub kind: TraceKind,
    pub goal: String,
    pub base_url: String,
    pub api_base_url: String,
    pub env: BTreeMap<String, String>,
    /// Step budget; 15 when unset
    pub max_steps: Option<usize>,
}

/// Why exploration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// The model returned the stop signal
    GoalReached,
    BudgetExhausted,
    StepFailed,
    /// No valid step after every proposal attempt
    InvalidProposal,
    /// The session could not continue (setup or observation failed)
    Halted,
}

/// Result of an exploration run
#[derive(Debug, Clone)]
pub struct ExploreOutcome {
    pub trace: Trace,
    /// Where the trace was written; `None` when no step ran
    pub trace_path: Option<PathBuf>,
    pub compiled_path: Option<PathBuf>,
    pub stop_reason: StopReason,
    pub run: RunOutcome,
}

/// A parsed model reply
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    Stop,
    Step(Step),
}

enum Phase {
    Observing,
    Proposing(Value),
    Executing(Step),
    Done(StopReason),
}

/// Drives exploration runs
pub struct Explorer {
    config: EngineConfig,
    llm: Box<dyn LanguageModel>,
    compiler: Option<Box<dyn TraceCompiler>>,
}

impl Explorer {
    pub fn new(config: EngineConfig, llm: Box<dyn LanguageModel>) -> Self {
        Self {
            config,
            llm,
            compiler: None,
        }
    }

    pub fn with_compiler(mut self, compiler: Box<dyn TraceCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// The trace skeleton an exploration fills in
    pub fn draft_trace(&self, options: &ExplorerOptions) -> Trace {
        Trace {
            version: TRACE_VERSION,
            kind: options.kind,
            test_name: options.test_name.clone(),
            description: options.goal.clone(),
            app: options.app.clone(),
            base_url: options.base_url.clone(),
            api_base_url: options.api_base_url.clone(),
            created_at: Utc::now(),
            generator: Generator {
                mode: "explore".to_string(),
                llm_provider: self.llm.provider().to_string(),
                llm_model: self.llm.model().to_string(),
            },
            inputs: TraceInputs {
                env: options.env.clone(),
            },
            policies: Policies {
                headless: true,
                no_mocks: true,
                max_steps: options.max_steps.unwrap_or_else(|| Policies::default().max_steps),
                timeouts_ms: 60_000,
            },
            steps: Vec::new(),
        }
    }

    /// Explore toward the goal, then persist and compile what ran.
    ///
    /// Step failures and unusable proposals end in a `fail` verdict. An
    /// unreachable model is returned as `Err` after the run is finalized.
    pub async fn explore(
        &self,
        options: &ExplorerOptions,
        session_options: SessionOptions,
    ) -> Result<ExploreOutcome> {
        let mut trace = self.draft_trace(options);
        let budget = trace.policies.max_steps;
        let system_prompt = system_prompt();

        let mut session = RunSession::open(&trace, RunMode::Explore, &self.config, session_options).await?;
        info!(
            "Exploring {}/{} with {} ({}), budget {} step(s)",
            trace.app,
            trace.test_name,
            self.llm.provider(),
            self.llm.model(),
            budget
        );

        let mut fatal: Option<Error> = None;
        let mut phase = Phase::Observing;
        let stop_reason = loop {
            phase = match phase {
                Phase::Observing => {
                    if session.is_halted() {
                        Phase::Done(StopReason::Halted)
                    } else if trace.steps.len() >= budget {
                        Phase::Done(StopReason::BudgetExhausted)
                    } else {
                        let observed = observe(&session, trace.kind).await;
                        match observed {
                            Ok(observation) => Phase::Proposing(observation),
                            Err(e) => {
                                session.halt(format!("Observation failed: {e}")).await;
                                Phase::Done(StopReason::Halted)
                            }
                        }
                    }
                }
                Phase::Proposing(observation) => {
                    let user_prompt = user_prompt(&trace, &observation);
                    match self.propose(&system_prompt, &user_prompt, trace.steps.len()).await {
                        Ok(Proposal::Stop) => Phase::Done(StopReason::GoalReached),
                        Ok(Proposal::Step(step)) => Phase::Executing(step),
                        Err(e @ Error::InvalidProposal(_)) => {
                            session.halt(e.to_string()).await;
                            Phase::Done(StopReason::InvalidProposal)
                        }
                        Err(e) => {
                            session.halt(e.to_string()).await;
                            fatal = Some(e);
                            Phase::Done(StopReason::Halted)
                        }
                    }
                }
                Phase::Executing(step) => match session.execute(&step).await {
                    Ok(record) => {
                        trace.steps.push(step);
                        if record.passed() {
                            Phase::Observing
                        } else {
                            Phase::Done(StopReason::StepFailed)
                        }
                    }
                    Err(e) => {
                        fatal = Some(e);
                        Phase::Done(StopReason::Halted)
                    }
                },
                Phase::Done(reason) => break reason,
            };
        };

        let run = session.close().await?;
        if let Some(e) = fatal {
            return Err(e);
        }
        info!(
            "Exploration of {}/{} ended ({:?}) after {} step(s): {:?}",
            trace.app,
            trace.test_name,
            stop_reason,
            trace.steps.len(),
            run.verdict.status
        );

        let mut trace_path = None;
        let mut compiled_path = None;
        if trace.steps.is_empty() {
            warn!("Exploration produced no steps; nothing to persist");
        } else {
            let path = trace.default_path(&self.config.traces_dir);
            trace.save(&path)?;
            info!("Saved trace to {}", path.display());
            if let Some(compiler) = &self.compiler {
                compiled_path = Some(compiler.compile(&trace, &self.config.compiled_dir).await?);
            }
            trace_path = Some(path);
        }

        Ok(ExploreOutcome {
            trace,
            trace_path,
            compiled_path,
            stop_reason,
            run,
        })
    }

    /// Ask for the next step, re-prompting with the validation error
    async fn propose(&self, system: &str, user: &str, index: usize) -> Result<Proposal> {
        let mut prompt = user.to_string();
        let mut last_error = String::new();

        for attempt in 1..=PROPOSAL_ATTEMPTS {
            let reply = self.llm.generate(system, &prompt).await?;
            match parse_proposal(&reply, index) {
                Ok(proposal) => return Ok(proposal),
                Err(e) => {
                    warn!("Rejected proposal (attempt {}/{}): {}", attempt, PROPOSAL_ATTEMPTS, e);
                    prompt = format!("{user}\nPrevious error: {e}");
                    last_error = e;
                }
            }
        }

        Err(Error::InvalidProposal(format!(
            "{last_error} (after {PROPOSAL_ATTEMPTS} attempts)"
        )))
    }
}

fn system_prompt() -> String {
    let actions: Vec<&str> = Action::ALL.iter().map(Action::as_str).collect();
    format!(
        "You operate the Agentic Test Framework. Output only JSON objects defining the next step. \
         Allowed actions: {}. Use data-testid selectors when possible. \
         Return {{\"action\":\"stop\"}} when the goal is met.",
        actions.join(", ")
    )
}

fn user_prompt(trace: &Trace, observation: &Value) -> String {
    let start = trace.steps.len().saturating_sub(RECENT_STEPS);
    let recent: Vec<Value> = trace.steps[start..]
        .iter()
        .map(|s| json!({ "action": s.action, "selectorOrEndpoint": s.selector_or_endpoint }))
        .collect();

    json!({
        "goal": trace.description,
        "type": trace.kind,
        "observation": observation,
        "recentSteps": recent,
    })
    .to_string()
}

async fn observe(session: &RunSession, kind: TraceKind) -> Result<Value> {
    let executor = session.executor();
    match kind {
        TraceKind::Ui => match executor.browser() {
            Some(browser) => observe_page(browser).await,
            None => Ok(json!({})),
        },
        TraceKind::Api => {
            let last = executor
                .last_exchange()
                .map(serde_json::to_value)
                .transpose()?
                .map(|v| session.recorder().redactor().redact_value(&v))
                .unwrap_or(Value::Null);
            Ok(json!({ "lastResponse": last }))
        }
    }
}

async fn observe_page(browser: &dyn BrowserDriver) -> Result<Value> {
    let url = browser.current_url().await?;
    let title = browser.title().await?;
    let elements: Vec<ElementSummary> = browser.interactable_elements(OBSERVED_ELEMENTS).await?;
    debug!("Observed {} ({} element(s))", url, elements.len());
    Ok(json!({ "url": url, "title": title, "elements": elements }))
}

/// Parse and validate a model reply into the next step (`index` is zero-based)
pub fn parse_proposal(reply: &str, index: usize) -> std::result::Result<Proposal, String> {
    let value = extract_json_object(reply).ok_or_else(|| "reply contains no JSON object".to_string())?;
    normalize_step(&value, index)
}

/// Find a JSON object in a reply: the whole text, a fenced block, or the
/// outermost braces
pub fn extract_json_object(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    let mut candidates = vec![trimmed];

    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        let body = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(end) = body.find("```") {
            candidates.push(body[..end].trim());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    candidates
        .into_iter()
        .filter_map(|c| serde_json::from_str::<Value>(c).ok())
        .find(Value::is_object)
}

fn normalize_step(value: &Value, index: usize) -> std::result::Result<Proposal, String> {
    let object = value
        .as_object()
        .ok_or_else(|| "proposal must be a JSON object".to_string())?;

    let action_name = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "proposal has no action".to_string())?;
    if action_name == STOP_ACTION {
        return Ok(Proposal::Stop);
    }
    let action = Action::parse(action_name).ok_or_else(|| format!("unknown action '{action_name}'"))?;

    let selector_or_endpoint = object
        .get("selectorOrEndpoint")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| "selectorOrEndpoint must be a non-empty string".to_string())?;

    Ok(Proposal::Step(Step {
        id: format!("s{}", index + 1),
        action,
        selector_or_endpoint: selector_or_endpoint.to_string(),
        input: object.get("input").filter(|v| !v.is_null()).cloned(),
        expected: object.get("expected").and_then(Value::as_object).cloned(),
        guards: object.get("guards").and_then(Value::as_object).and_then(filter_guards),
    }))
}

/// Keep only recognized guard keys with the right types
fn filter_guards(raw: &Map<String, Value>) -> Option<Guards> {
    let text_includes = match raw.get("expectTextIncludes") {
        Some(Value::String(s)) if !s.is_empty() => Some(OneOrMany::One(s.clone())),
        Some(Value::Array(items)) if !items.is_empty() => {
            let texts: Vec<String> = items.iter().filter_map(Value::as_str).map(str::to_string).collect();
            (!texts.is_empty()).then_some(OneOrMany::Many(texts))
        }
        _ => None,
    };

    let guards = Guards {
        expect_url_includes: raw.get("expectUrlIncludes").and_then(Value::as_str).map(str::to_string),
        expect_text_includes: text_includes,
        expect_status_code: raw
            .get("expectStatusCode")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok()),
        allow_retry: raw.get("allowRetry").and_then(Value::as_bool),
        timeout_ms: raw.get("timeoutMs").and_then(Value::as_u64),
    };

    (guards != Guards::default()).then_some(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_fenced_and_embedded_objects() {
        let fenced = "Here you go:\n```json\n{\"action\":\"stop\"}\n```";
        assert_eq!(extract_json_object(fenced), Some(json!({ "action": "stop" })));

        let embedded = "Next: {\"action\":\"click\",\"selectorOrEndpoint\":\"#go\"} done";
        assert_eq!(extract_json_object(embedded).unwrap()["action"], "click");

        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("[1, 2]").is_none());
    }

    #[test]
    fn test_stop_signal() {
        assert_eq!(parse_proposal(r#"{"action":"stop"}"#, 4), Ok(Proposal::Stop));
    }

    #[test]
    fn test_step_is_normalized() {
        let reply = r#"{
            "action": "post",
            "selectorOrEndpoint": "/api/login",
            "input": {"username": "${env.DEMO_USERNAME}"},
            "expected": "not an object",
            "guards": {"expectStatusCode": 200, "allowRetry": "yes", "timeoutMs": 500, "bogus": 1}
        }"#;

        let Proposal::Step(step) = parse_proposal(reply, 1).unwrap() else {
            panic!("expected a step");
        };
        assert_eq!(step.id, "s2");
        assert_eq!(step.action, Action::Post);
        assert!(step.expected.is_none());
        let guards = step.guards.unwrap();
        assert_eq!(guards.expect_status_code, Some(200));
        assert_eq!(guards.allow_retry, None);
        assert_eq!(guards.timeout_ms, Some(500));
    }

    #[test]
    fn test_rejections() {
        assert!(parse_proposal(r##"{"action":"hover","selectorOrEndpoint":"#a"}"##, 0)
            .unwrap_err()
            .contains("unknown action"));
        assert!(parse_proposal(r#"{"action":"click","selectorOrEndpoint":"  "}"#, 0)
            .unwrap_err()
            .contains("selectorOrEndpoint"));
        assert!(parse_proposal(r##"{"selectorOrEndpoint":"#a"}"##, 0).is_err());
    }

    #[test]
    fn test_empty_guards_are_dropped() {
        let reply = r##"{"action":"click","selectorOrEndpoint":"#a","guards":{"expectTextIncludes":""}}"##;
        let Proposal::Step(step) = parse_proposal(reply, 0).unwrap() else {
            panic!("expected a step");
        };
        assert!(step.guards.is_none());
        assert!(step.input.is_none());
    }

    #[test]
    fn test_system_prompt_lists_actions() {
        let prompt = system_prompt();
        assert!(prompt.contains("waitForSelector"));
        assert!(prompt.contains(r#"{"action":"stop"}"#));
    }
}
