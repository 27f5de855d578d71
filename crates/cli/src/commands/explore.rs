//! Explore Command

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use atf_core::{
    EngineConfig, Explorer, ExplorerOptions, LlmClient, LlmProvider, SessionOptions, TraceKind,
};
use clap::{Args, ValueEnum};

use super::replay::print_outcome;
use crate::output::{print_success, print_warning, OutputFormat};
use crate::{EXIT_FAIL, EXIT_PASS};

/// Credentials made available to explored traces without being written into them
const INHERITED_ENV: [&str; 2] = ["DEMO_USERNAME", "DEMO_PASSWORD"];

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Ui,
    Api,
}

impl From<KindArg> for TraceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Ui => TraceKind::Ui,
            KindArg::Api => TraceKind::Api,
        }
    }
}

#[derive(Args)]
pub struct ExploreArgs {
    /// App under test
    #[arg(long)]
    pub app: String,

    /// Name of the trace to produce
    #[arg(long = "test-name", alias = "testName")]
    pub test_name: String,

    /// What the explored trace should accomplish
    #[arg(long)]
    pub goal: String,

    /// Trace type
    #[arg(long = "type", value_enum, default_value = "ui")]
    pub kind: KindArg,

    /// UI base URL
    #[arg(long, env = "UI_BASE_URL", default_value = "http://localhost:3010")]
    pub base_url: String,

    /// API base URL
    #[arg(long, env = "API_BASE_URL", default_value = "http://localhost:3020")]
    pub api_base_url: String,

    /// Step budget
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// LLM provider (ollama, openai-compat)
    #[arg(long = "llm-provider", alias = "llm.provider")]
    pub llm_provider: Option<LlmProvider>,

    /// LLM base URL
    #[arg(long = "llm-base-url", alias = "llm.baseUrl")]
    pub llm_base_url: Option<String>,

    /// LLM model
    #[arg(long = "llm-model", alias = "llm.model")]
    pub llm_model: Option<String>,

    /// LLM API key
    #[arg(long = "llm-api-key", alias = "llm.apiKey", env = "ATF_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// LLM request timeout in milliseconds
    #[arg(long = "llm-timeout-ms", alias = "llm.timeoutMs")]
    pub llm_timeout_ms: Option<u64>,

    /// Extra environment input (KEY=VALUE), repeatable
    #[arg(long = "env", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Inherited credentials are declared empty so they are read from the
/// process environment at run time; explicit `--env` values win
fn environment(pairs: &[(String, String)]) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = INHERITED_ENV
        .iter()
        .filter(|key| std::env::var(key).is_ok())
        .map(|key| (key.to_string(), String::new()))
        .collect();
    env.extend(pairs.iter().cloned());
    env
}

pub async fn execute(args: ExploreArgs, mut config: EngineConfig, format: OutputFormat) -> Result<i32> {
    if let Some(provider) = args.llm_provider {
        config.llm.provider = provider;
    }
    if let Some(base_url) = &args.llm_base_url {
        config.llm.base_url = Some(base_url.clone());
    }
    if let Some(model) = &args.llm_model {
        config.llm.model = model.clone();
    }
    if let Some(key) = &args.llm_api_key {
        config.llm.api_key = Some(key.clone());
    }
    if let Some(timeout_ms) = args.llm_timeout_ms {
        config.llm.timeout_ms = timeout_ms;
    }
    if args.goal.trim().is_empty() {
        bail!("--goal must not be empty");
    }

    let llm = LlmClient::new(config.llm.clone())?;
    let options = ExplorerOptions {
        app: args.app,
        test_name: args.test_name,
        kind: args.kind.into(),
        goal: args.goal,
        base_url: args.base_url,
        api_base_url: args.api_base_url,
        env: environment(&args.env),
        max_steps: args.max_steps,
    };

    let explorer = Explorer::new(config, Box::new(llm));
    let outcome = explorer.explore(&options, SessionOptions::default()).await?;

    print_outcome(&outcome.run, format);
    match &outcome.trace_path {
        Some(path) => print_success(&format!(
            "Saved {} step(s) to {} ({:?})",
            outcome.trace.steps.len(),
            path.display(),
            outcome.stop_reason
        )),
        None => print_warning("No steps were executed; nothing saved"),
    }

    Ok(if outcome.run.verdict.passed() { EXIT_PASS } else { EXIT_FAIL })
}
