//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-run evidence directories live here
    pub runs_dir: PathBuf,

    /// Persisted traces, one subdirectory per app
    pub traces_dir: PathBuf,

    /// OpenAPI documents, one subdirectory per app
    pub contracts_dir: PathBuf,

    /// Output directory handed to the trace compiler
    pub compiled_dir: PathBuf,

    /// Browser driver configuration
    pub ui: UiConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            traces_dir: PathBuf::from("traces"),
            contracts_dir: PathBuf::from("apps"),
            compiled_dir: PathBuf::from("compiled-tests"),
            ui: UiConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Which browser driver a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiDriverKind {
    /// Remote worker; fails when `node` is not available
    Auto,
    Remote,
    Simulated,
}

impl std::str::FromStr for UiDriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "remote" => Ok(Self::Remote),
            "simulated" | "mock" => Ok(Self::Simulated),
            other => Err(Error::Config(format!("unknown ui driver '{other}'"))),
        }
    }
}

/// Browser driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub driver: UiDriverKind,

    /// Node binary used to run the worker script
    pub node_binary: String,

    /// Worker script path; the embedded script is used when unset
    pub helper_script: Option<PathBuf>,

    /// Upper bound for one transport request
    pub request_timeout_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            driver: UiDriverKind::Auto,
            node_binary: "node".to_string(),
            helper_script: None,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmProvider {
    Ollama,
    #[serde(alias = "openaiCompat")]
    OpenaiCompat,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenaiCompat => "openai-compat",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::OpenaiCompat => "https://api.openai.com/v1",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ollama" => Ok(Self::Ollama),
            "openai-compat" | "openaiCompat" | "openai" => Ok(Self::OpenaiCompat),
            other => Err(Error::Config(format!("unknown llm provider '{other}'"))),
        }
    }
}

/// LLM provider configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,

    /// Provider base URL; the provider default is used when unset
    pub base_url: Option<String>,

    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Ollama,
            base_url: None,
            model: "llama3.2".to_string(),
            api_key: None,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl LlmConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override fields from `ATF_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("ATF_RUNS_DIR") {
            self.runs_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATF_TRACES_DIR") {
            self.traces_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATF_CONTRACTS_DIR") {
            self.contracts_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATF_UI_DRIVER") {
            self.ui.driver = v.parse()?;
        }
        if let Some(v) = var("ATF_NODE_BINARY") {
            self.ui.node_binary = v;
        }
        if let Some(v) = var("ATF_LLM_PROVIDER") {
            self.llm.provider = v.parse()?;
        }
        if let Some(v) = var("ATF_LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
        if let Some(v) = var("ATF_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = var("ATF_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = var("ATF_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = v
                .parse()
                .map_err(|_| Error::Config(format!("ATF_LLM_TIMEOUT_MS is not a number: {v}")))?;
        }
        Ok(())
    }

    /// Where the OpenAPI document for an app would live, if any exists
    pub fn contract_path(&self, app: &str) -> Option<PathBuf> {
        let dir = self.contracts_dir.join(app);
        ["openapi.json", "openapi.yaml", "openapi.yml"]
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }
}
