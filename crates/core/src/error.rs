//! Error types for trace execution

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the ATF error
pub type Result<T> = std::result::Result<T, Error>;

/// Which interpolation namespace a missing binding belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Env,
    State,
}

impl std::fmt::Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingKind::Env => f.write_str("environment variable"),
            BindingKind::State => f.write_str("state value"),
        }
    }
}

/// ATF error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing {kind}: {key}")]
    MissingBinding { kind: BindingKind, key: String },

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Guard failed: {0}")]
    GuardViolation(String),

    #[error("Assertion failed: {0}")]
    AssertionMismatch(String),

    #[error("Contract validation failed for {method} {path} ({status}): {detail}")]
    ResponseSchemaViolation {
        method: String,
        path: String,
        status: u16,
        detail: String,
    },

    #[error("Driver transport terminated: {0}")]
    TransportTerminated(String),

    #[error("LLM could not produce a valid step: {0}")]
    InvalidProposal(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    #[error("Invalid trace: {0}")]
    InvalidTrace(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run halted: {0}")]
    RunHalted(String),

    #[error("Verdict already written for run {0}")]
    AlreadyFinalized(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure classification recorded on a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    GuardViolation,
    AssertionMismatch,
    MissingBinding,
    DriverError,
    ResponseSchemaViolation,
    TransportTerminated,
    InvalidProposal,
}

impl Error {
    /// Map an error onto the step failure taxonomy
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::MissingBinding { .. } => FailureKind::MissingBinding,
            Error::GuardViolation(_) => FailureKind::GuardViolation,
            Error::AssertionMismatch(_) => FailureKind::AssertionMismatch,
            Error::ResponseSchemaViolation { .. } => FailureKind::ResponseSchemaViolation,
            Error::TransportTerminated(_) => FailureKind::TransportTerminated,
            Error::InvalidProposal(_) => FailureKind::InvalidProposal,
            _ => FailureKind::DriverError,
        }
    }
}
