//! Declarative trace documents
//!
//! A trace is an ordered list of [`Step`]s plus the metadata needed to run
//! them: base URLs, declared environment inputs and execution policies.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// The only trace schema version this engine understands
pub const TRACE_VERSION: u32 = 1;

/// A complete trace document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub version: u32,

    #[serde(rename = "type")]
    pub kind: TraceKind,

    pub test_name: String,

    #[serde(default)]
    pub description: String,

    pub app: String,

    pub base_url: String,

    pub api_base_url: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub generator: Generator,

    #[serde(default)]
    pub inputs: TraceInputs,

    #[serde(default)]
    pub policies: Policies,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Ui,
    Api,
}

/// Who produced the trace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generator {
    pub mode: String,
    pub llm_provider: String,
    pub llm_model: String,
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            mode: "manual".to_string(),
            llm_provider: "none".to_string(),
            llm_model: "none".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceInputs {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Execution policies attached to a trace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policies {
    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default = "default_true")]
    pub no_mocks: bool,

    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Upper bound for a single step attempt
    #[serde(default = "default_timeout_ms")]
    pub timeouts_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_steps() -> usize {
    15
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            headless: true,
            no_mocks: true,
            max_steps: default_max_steps(),
            timeouts_ms: default_timeout_ms(),
        }
    }
}

/// A single step in a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,

    pub action: Action,

    pub selector_or_endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guards: Option<Guards>,
}

/// The closed action vocabulary shared by replay and exploration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Navigate,
    Click,
    Input,
    Select,
    Press,
    WaitForText,
    WaitForSelector,
    ExtractText,
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Action {
    pub const ALL: [Action; 13] = [
        Action::Navigate,
        Action::Click,
        Action::Input,
        Action::Select,
        Action::Press,
        Action::WaitForText,
        Action::WaitForSelector,
        Action::ExtractText,
        Action::Get,
        Action::Post,
        Action::Put,
        Action::Patch,
        Action::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Navigate => "navigate",
            Action::Click => "click",
            Action::Input => "input",
            Action::Select => "select",
            Action::Press => "press",
            Action::WaitForText => "waitForText",
            Action::WaitForSelector => "waitForSelector",
            Action::ExtractText => "extractText",
            Action::Get => "get",
            Action::Post => "post",
            Action::Put => "put",
            Action::Patch => "patch",
            Action::Delete => "delete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    /// HTTP method for API actions, `None` for UI actions
    pub fn http_method(&self) -> Option<reqwest::Method> {
        match self {
            Action::Get => Some(reqwest::Method::GET),
            Action::Post => Some(reqwest::Method::POST),
            Action::Put => Some(reqwest::Method::PUT),
            Action::Patch => Some(reqwest::Method::PATCH),
            Action::Delete => Some(reqwest::Method::DELETE),
            Action::Navigate
            | Action::Click
            | Action::Input
            | Action::Select
            | Action::Press
            | Action::WaitForText
            | Action::WaitForSelector
            | Action::ExtractText => None,
        }
    }

    pub fn is_ui(&self) -> bool {
        self.http_method().is_none()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Post-action checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guards {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_url_includes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_text_includes: Option<OneOrMany>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_retry: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Guards {
    /// Number of attempts a step carrying these guards may make
    pub fn attempt_budget(guards: Option<&Guards>) -> u32 {
        match guards.and_then(|g| g.allow_retry) {
            Some(true) => 2,
            _ => 1,
        }
    }
}

/// A string or a list of strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OneOrMany::One(s) => vec![s.as_str()],
            OneOrMany::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

impl Trace {
    /// Parse a trace from JSON and check the compatibility guard
    pub fn from_json(json: &str) -> Result<Self> {
        let trace: Trace = serde_json::from_str(json)?;
        trace.validate()?;
        Ok(trace)
    }

    /// Parse a trace from a `.trace.json` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Reject documents this engine cannot run
    pub fn validate(&self) -> Result<()> {
        if self.version != TRACE_VERSION {
            return Err(Error::InvalidTrace(format!(
                "unsupported version {} (expected {})",
                self.version, TRACE_VERSION
            )));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidTrace("trace has no steps".to_string()));
        }
        if self.test_name.trim().is_empty() || self.app.trim().is_empty() {
            return Err(Error::InvalidTrace("testName and app are required".to_string()));
        }
        Ok(())
    }

    /// Where this trace lives under a traces directory
    pub fn default_path(&self, traces_dir: &Path) -> PathBuf {
        traces_dir
            .join(&self.app)
            .join(format!("{}.trace.json", self.test_name))
    }

    /// Write the trace as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// List `*.trace.json` files for an app
    pub fn list(traces_dir: &Path, app: &str) -> Result<Vec<PathBuf>> {
        let dir = traces_dir.join(app);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut traces: Vec<PathBuf> = walkdir::WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with(".trace.json"))
                    .unwrap_or(false)
            })
            .collect();
        traces.sort();
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const API_TRACE: &str = r#"{
        "version": 1,
        "type": "api",
        "testName": "cart_smoke",
        "app": "demo-system",
        "baseUrl": "http://localhost:3010",
        "apiBaseUrl": "http://localhost:3020",
        "inputs": { "env": { "DEMO_USERNAME": "user" } },
        "steps": [
            {
                "id": "s1",
                "action": "post",
                "selectorOrEndpoint": "/api/login",
                "input": { "body": { "username": "${ENV:DEMO_USERNAME}" } },
                "expected": { "saveState": { "authToken": "token" } },
                "guards": { "expectStatusCode": 200, "allowRetry": true }
            },
            {
                "id": "s2",
                "action": "waitForText",
                "selectorOrEndpoint": "Welcome",
                "guards": { "expectTextIncludes": ["Welcome", "Cart"] }
            }
        ]
    }"#;

    #[test]
    fn test_parse_api_trace() {
        let trace = Trace::from_json(API_TRACE).unwrap();
        assert_eq!(trace.kind, TraceKind::Api);
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.steps[0].action, Action::Post);
        assert_eq!(trace.policies.max_steps, 15);

        let guards = trace.steps[1].guards.as_ref().unwrap();
        assert_eq!(
            guards.expect_text_includes.as_ref().unwrap().values(),
            vec!["Welcome", "Cart"]
        );
    }

    #[test]
    fn test_rejects_wrong_version() {
        let json = API_TRACE.replace("\"version\": 1", "\"version\": 2");
        assert!(matches!(Trace::from_json(&json), Err(Error::InvalidTrace(_))));
    }

    #[test]
    fn test_rejects_unknown_action() {
        let json = API_TRACE.replace("\"waitForText\"", "\"hover\"");
        assert!(Trace::from_json(&json).is_err());
    }

    #[test]
    fn test_attempt_budget() {
        assert_eq!(Guards::attempt_budget(None), 1);
        let retry = Guards {
            allow_retry: Some(true),
            ..Default::default()
        };
        assert_eq!(Guards::attempt_budget(Some(&retry)), 2);
        let no_retry = Guards {
            allow_retry: Some(false),
            ..Default::default()
        };
        assert_eq!(Guards::attempt_budget(Some(&no_retry)), 1);
    }

    #[test]
    fn test_action_classification() {
        assert!(Action::ExtractText.is_ui());
        assert_eq!(Action::Patch.http_method(), Some(reqwest::Method::PATCH));
        assert_eq!(Action::parse("waitForSelector"), Some(Action::WaitForSelector));
        assert_eq!(Action::parse("stop"), None);
    }
}
