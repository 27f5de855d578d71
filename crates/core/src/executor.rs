//! Step execution: resolve, dispatch, guards, expectations, evidence

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactRecorder, LogLevel, Status, StepRecord};
use crate::browser::{self, BrowserDriver};
use crate::config::UiConfig;
use crate::contract::ContractValidator;
use crate::error::{Error, Result};
use crate::http::{HttpDriver, HttpExchange, HttpRequest, DEFAULT_REQUEST_TIMEOUT};
use crate::interpolation::{lookup_value, InterpolationContext};
use crate::trace::{Action, Guards, OneOrMany, Step, Trace};

/// Input prefix on `extractText` that stores the text in run state
const SAVE_DIRECTIVE: &str = "save:";

/// Knobs for one executor
#[derive(Default)]
pub struct ExecutorOptions {
    pub ui: UiConfig,
    /// Overrides the trace's `policies.headless`
    pub headless: Option<bool>,
    pub contract: Option<ContractValidator>,
    /// Use this driver instead of launching one from `ui`
    pub browser: Option<Box<dyn BrowserDriver>>,
}

/// A step with every template resolved
#[derive(Debug, Clone)]
struct ResolvedStep {
    target: String,
    input: Option<Value>,
    expected: Option<Map<String, Value>>,
    guards: Option<Guards>,
}

#[derive(Debug, Deserialize)]
struct SelectorText {
    selector: String,
    #[serde(default)]
    equals: Option<String>,
    #[serde(default)]
    includes: Option<String>,
}

/// Runs the steps of one trace against live drivers
pub struct TraceExecutor {
    base_url: String,
    headless: bool,
    eager_browser: bool,
    attempt_timeout: Option<Duration>,
    ctx: InterpolationContext,
    http: HttpDriver,
    contract: Option<ContractValidator>,
    ui_config: UiConfig,
    pending_browser: Option<Box<dyn BrowserDriver>>,
    browser: Option<Box<dyn BrowserDriver>>,
    last_exchange: Option<HttpExchange>,
    recorder: Arc<ArtifactRecorder>,
}

impl TraceExecutor {
    pub fn new(trace: &Trace, recorder: Arc<ArtifactRecorder>, options: ExecutorOptions) -> Result<Self> {
        let timeout_ms = trace.policies.timeouts_ms;
        let attempt_timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        Ok(Self {
            base_url: trace.base_url.clone(),
            headless: options.headless.unwrap_or(trace.policies.headless),
            eager_browser: trace.kind == crate::trace::TraceKind::Ui,
            attempt_timeout,
            ctx: InterpolationContext::new(&trace.base_url, &trace.api_base_url, &trace.inputs.env),
            http: HttpDriver::new(
                &trace.api_base_url,
                attempt_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            )?,
            contract: options.contract,
            ui_config: options.ui,
            pending_browser: options.browser,
            browser: None,
            last_exchange: None,
            recorder,
        })
    }

    pub fn context(&self) -> &InterpolationContext {
        &self.ctx
    }

    /// The live browser session, if one was started
    pub fn browser(&self) -> Option<&dyn BrowserDriver> {
        self.browser.as_deref()
    }

    pub fn last_exchange(&self) -> Option<&HttpExchange> {
        self.last_exchange.as_ref()
    }

    /// Start the browser up front for UI traces
    pub async fn setup(&mut self) -> Result<()> {
        if self.eager_browser {
            self.ensure_browser().await?;
        }
        Ok(())
    }

    /// Close the browser session, if any
    pub async fn teardown(&mut self) -> Result<()> {
        self.pending_browser = None;
        if let Some(browser) = self.browser.take() {
            debug!("Stopping {} browser", browser.kind());
            browser.stop().await?;
        }
        Ok(())
    }

    /// Execute one step and describe the outcome; never returns an error
    pub async fn run_step(&mut self, step: &Step) -> StepRecord {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut artifacts = BTreeMap::new();

        let (resolved, outcome, attempts) = match self.resolve(step) {
            Ok(resolved) => {
                let (outcome, attempts) = self.attempt_with_retry(step, &resolved).await;
                (Some(resolved), outcome, attempts)
            }
            Err(e) => (None, Err(e), 0),
        };

        if outcome.is_err() {
            if let Some(browser) = self.browser.as_deref() {
                match self.recorder.save_ui_screenshot(&step.id, browser).await {
                    Ok(path) => {
                        artifacts.insert("screenshot".to_string(), path);
                    }
                    Err(e) => warn!("Failed to capture screenshot for {}: {}", step.id, e),
                }
            }
        }

        if !step.action.is_ui() {
            if let Some(exchange) = &self.last_exchange {
                match self.recorder.save_api_exchange(&step.id, exchange).await {
                    Ok(path) => {
                        artifacts.insert("api".to_string(), path);
                    }
                    Err(e) => warn!("Failed to persist exchange for {}: {}", step.id, e),
                }
            }
        }

        let duration_ms = clock.elapsed().as_millis() as u64;
        let (status, error, failure_kind) = match &outcome {
            Ok(()) => {
                info!("Step {} ({}) passed in {}ms", step.id, step.action, duration_ms);
                (Status::Pass, None, None)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(log_err) = self
                    .recorder
                    .log(
                        &format!("Step {} failed: {}", step.id, message),
                        LogLevel::Error,
                        fields(&[("stepId", json!(step.id)), ("failureKind", json!(e.failure_kind()))]),
                    )
                    .await
                {
                    warn!("Failed to log failure of {}: {}", step.id, log_err);
                }
                (Status::Fail, Some(message), Some(e.failure_kind()))
            }
        };

        let resolved = resolved.as_ref();
        StepRecord {
            step_id: step.id.clone(),
            action: step.action,
            status,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            attempts,
            error,
            failure_kind,
            selector_or_endpoint: resolved
                .map(|r| r.target.clone())
                .unwrap_or_else(|| step.selector_or_endpoint.clone()),
            input: resolved.map_or_else(|| step.input.clone(), |r| r.input.clone()),
            expected: resolved
                .map_or_else(|| step.expected.clone(), |r| r.expected.clone())
                .map(Value::Object),
            guards: resolved
                .map_or_else(|| step.guards.clone(), |r| r.guards.clone())
                .and_then(|g| serde_json::to_value(g).ok()),
            artifacts,
        }
    }

    fn resolve(&self, step: &Step) -> Result<ResolvedStep> {
        let target = self.ctx.resolve(&step.selector_or_endpoint)?;
        let input = step.input.as_ref().map(|v| self.ctx.resolve_deep(v)).transpose()?;

        let expected = match &step.expected {
            Some(map) => match self.ctx.resolve_deep(&Value::Object(map.clone()))? {
                Value::Object(map) => Some(map),
                _ => None,
            },
            None => None,
        };

        let guards = match &step.guards {
            Some(guards) => {
                let resolved = self.ctx.resolve_deep(&serde_json::to_value(guards)?)?;
                Some(serde_json::from_value(resolved)?)
            }
            None => None,
        };

        Ok(ResolvedStep {
            target,
            input,
            expected,
            guards,
        })
    }

    /// Action, guards and expectations form one attempt
    async fn attempt_with_retry(&mut self, step: &Step, resolved: &ResolvedStep) -> (Result<()>, u32) {
        let budget = Guards::attempt_budget(resolved.guards.as_ref());
        let mut last = Ok(());

        for attempt in 1..=budget {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.attempt(step.action, resolved)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Driver(format!(
                        "step {} timed out after {}ms",
                        step.id,
                        limit.as_millis()
                    ))),
                },
                None => self.attempt(step.action, resolved).await,
            };

            match outcome {
                Ok(()) => return (Ok(()), attempt),
                Err(e) => {
                    if attempt < budget {
                        if let Err(log_err) = self
                            .recorder
                            .log(
                                &format!("Retrying step {} due to {}", step.id, e),
                                LogLevel::Warn,
                                fields(&[("stepId", json!(step.id)), ("attempt", json!(attempt))]),
                            )
                            .await
                        {
                            warn!("Failed to log retry of {}: {}", step.id, log_err);
                        }
                    }
                    last = Err(e);
                }
            }
        }

        (last, budget)
    }

    async fn attempt(&mut self, action: Action, step: &ResolvedStep) -> Result<()> {
        if action.is_ui() {
            self.ensure_browser().await?;
        }

        let target = step.target.as_str();
        let timeout_ms = step.guards.as_ref().and_then(|g| g.timeout_ms);
        let mut extracted = None;

        match action {
            Action::Navigate => self.live_browser()?.goto(target).await?,
            Action::Click => self.live_browser()?.click(target).await?,
            Action::Input => {
                let text = input_text(step.input.as_ref());
                self.live_browser()?.type_text(target, &text).await?
            }
            Action::Select => {
                let value = input_text(step.input.as_ref());
                self.live_browser()?.select(target, &value).await?
            }
            Action::Press => {
                let key = input_text(step.input.as_ref());
                self.live_browser()?.press(target, &key).await?
            }
            Action::WaitForText => self.live_browser()?.wait_for_text(target, timeout_ms).await?,
            Action::WaitForSelector => {
                self.live_browser()?
                    .wait_for_selector(target, timeout_ms)
                    .await?
            }
            Action::ExtractText => {
                let text = self.live_browser()?.extract_text(target).await?;
                if let Some(Value::String(input)) = &step.input {
                    if let Some(key) = input.strip_prefix(SAVE_DIRECTIVE).filter(|k| !k.is_empty()) {
                        debug!("Saved extracted text as {}", key);
                        self.ctx.save_state(key, Value::String(text.clone()));
                    }
                }
                extracted = Some(text);
            }
            Action::Get | Action::Post | Action::Put | Action::Patch | Action::Delete => {
                self.http_call(action, target, step.input.as_ref()).await?
            }
        }

        self.apply_guards(step.guards.as_ref()).await?;
        self.apply_expected(action, step.expected.as_ref(), extracted.as_deref())
            .await
    }

    async fn http_call(&mut self, action: Action, endpoint: &str, input: Option<&Value>) -> Result<()> {
        let method = action
            .http_method()
            .ok_or_else(|| Error::Driver(format!("{action} is not an HTTP action")))?;

        self.last_exchange = None;
        let request = HttpRequest::from_input(method.clone(), endpoint, input);
        let exchange = self.http.send(&request).await?;
        let status = exchange.status;
        self.last_exchange = Some(exchange);

        if let (Some(contract), Some(exchange)) = (&self.contract, &self.last_exchange) {
            contract.validate_response(method.as_str(), endpoint, status, &exchange.body)?;
        }
        Ok(())
    }

    async fn apply_guards(&self, guards: Option<&Guards>) -> Result<()> {
        let Some(guards) = guards else {
            return Ok(());
        };

        if let Some(fragment) = &guards.expect_url_includes {
            let url = match self.browser() {
                Some(browser) => browser.current_url().await?,
                None => String::new(),
            };
            if !url.contains(fragment.as_str()) {
                return Err(Error::GuardViolation(format!("URL does not include {fragment}")));
            }
        }

        if let Some(expected) = &guards.expect_text_includes {
            let body = match self.browser() {
                Some(browser) => Some(browser.text_content("body").await?),
                None => None,
            };
            for value in expected.values() {
                if !body.as_deref().is_some_and(|b| b.contains(value)) {
                    return Err(Error::GuardViolation(format!("page text missing \"{value}\"")));
                }
            }
        }

        if let Some(code) = guards.expect_status_code {
            let exchange = self.last_exchange.as_ref().ok_or_else(|| {
                Error::GuardViolation("no API response to check status code".to_string())
            })?;
            if exchange.status != code {
                return Err(Error::GuardViolation(format!(
                    "expected status {}, received {}",
                    code, exchange.status
                )));
            }
        }

        Ok(())
    }

    async fn apply_expected(
        &mut self,
        action: Action,
        expected: Option<&Map<String, Value>>,
        extracted: Option<&str>,
    ) -> Result<()> {
        let Some(expected) = expected.filter(|e| !e.is_empty()) else {
            return Ok(());
        };

        if !action.is_ui() {
            let exchange = self.last_exchange.as_ref().ok_or_else(|| {
                Error::AssertionMismatch("no API response to validate expected payload".to_string())
            })?;

            let mut captured = Vec::new();
            if let Some(Value::Object(save)) = expected.get("saveState") {
                for (key, path) in save {
                    let path = path.as_str().ok_or_else(|| {
                        Error::AssertionMismatch(format!("saveState path for '{key}' must be a string"))
                    })?;
                    match lookup_value(&exchange.body, path) {
                        Some(value) if !value.is_null() => captured.push((key.clone(), value.clone())),
                        _ => {
                            return Err(Error::AssertionMismatch(format!(
                                "saveState path '{path}' not found in response"
                            )))
                        }
                    }
                }
            }

            let subset: Map<String, Value> = expected
                .iter()
                .filter(|(k, _)| k.as_str() != "saveState")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mismatch = if subset.is_empty() {
                None
            } else {
                subset_mismatch(&exchange.body, &Value::Object(subset), "")
            };

            for (key, value) in captured {
                debug!("Captured state {}", key);
                self.ctx.save_state(key, value);
            }

            return match mismatch {
                Some(at) if at.is_empty() => Err(Error::AssertionMismatch(
                    "API response body does not match expected subset".to_string(),
                )),
                Some(at) => Err(Error::AssertionMismatch(format!(
                    "API response body does not match expected subset at {at}"
                ))),
                None => Ok(()),
            };
        }

        let Some(browser) = self.browser() else {
            return Ok(());
        };

        if let Some(value) = expected.get("textIncludes") {
            let wanted: OneOrMany = serde_json::from_value(value.clone())
                .map_err(|e| Error::AssertionMismatch(format!("invalid textIncludes: {e}")))?;
            let body = browser.text_content("body").await?;
            for needle in wanted.values() {
                if !body.contains(needle) {
                    return Err(Error::AssertionMismatch(format!("Expected text \"{needle}\" not found")));
                }
            }
        }

        if let Some(value) = expected.get("selectorText") {
            let check: SelectorText = serde_json::from_value(value.clone())
                .map_err(|e| Error::AssertionMismatch(format!("invalid selectorText: {e}")))?;
            let text = browser.text_content(&check.selector).await?;
            let text = text.trim();
            if let Some(equals) = &check.equals {
                if text != equals {
                    return Err(Error::AssertionMismatch(format!(
                        "Expected selector text to equal \"{equals}\", found \"{text}\""
                    )));
                }
            }
            if let Some(includes) = &check.includes {
                if !text.contains(includes.as_str()) {
                    return Err(Error::AssertionMismatch(format!(
                        "Expected selector text to include \"{includes}\""
                    )));
                }
            }
        }

        if let Some(Value::Object(save)) = expected.get("saveState") {
            let captures: Vec<(String, Value)> = save
                .iter()
                .map(|(key, literal)| {
                    let value = match extracted {
                        Some(text) => Value::String(text.to_string()),
                        None => literal.clone(),
                    };
                    (key.clone(), value)
                })
                .collect();
            for (key, value) in captures {
                self.ctx.save_state(key, value);
            }
        }

        Ok(())
    }

    fn live_browser(&self) -> Result<&dyn BrowserDriver> {
        self.browser()
            .ok_or_else(|| Error::Driver("browser session not started".to_string()))
    }

    async fn ensure_browser(&mut self) -> Result<()> {
        if self.browser.is_some() {
            return Ok(());
        }
        let driver = match self.pending_browser.take() {
            Some(driver) => driver,
            None => browser::launch(&self.ui_config)?,
        };
        info!("Starting {} browser at {}", driver.kind(), self.base_url);
        driver.start(&self.base_url, self.headless).await?;
        self.browser = Some(driver);
        Ok(())
    }
}

fn input_text(input: Option<&Value>) -> String {
    match input {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Partial deep match.
///
/// Objects match when every expected key matches; arrays match when every
/// expected element matches some actual element; scalars must be equal.
/// Returns the path of the first mismatch.
pub fn subset_mismatch(actual: &Value, expected: &Value, path: &str) -> Option<String> {
    let child = |key: &str| {
        if path.is_empty() {
            key.to_string()
        } else {
            format!("{path}.{key}")
        }
    };

    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected.iter().find_map(|(key, want)| {
            match actual.get(key) {
                Some(have) => subset_mismatch(have, want, &child(key)),
                None => Some(child(key)),
            }
        }),
        (Value::Array(actual), Value::Array(expected)) => {
            expected.iter().enumerate().find_map(|(i, want)| {
                let found = actual
                    .iter()
                    .any(|have| subset_mismatch(have, want, "").is_none());
                (!found).then(|| child(&i.to_string()))
            })
        }
        (Value::Number(a), Value::Number(b)) => {
            (a != b && a.as_f64() != b.as_f64()).then(|| path.to_string())
        }
        (a, b) => (a != b).then(|| path.to_string()),
    }
}
