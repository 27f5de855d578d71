//! ATF Core Library
//!
//! Executes declarative UI/API traces, records tamper-evident run evidence
//! and explores new traces with an LLM.

pub mod artifacts;
pub mod browser;
pub mod config;
pub mod contract;
pub mod error;
pub mod executor;
pub mod explorer;
pub mod http;
pub mod interpolation;
pub mod llm;
pub mod manifest;
pub mod redaction;
pub mod report;
pub mod session;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use artifacts::{ArtifactRecorder, RunMode, RunVerdict, Status, StepRecord};
pub use browser::{BrowserDriver, MockBrowser, RemoteBrowser};
pub use config::{EngineConfig, LlmConfig, LlmProvider, UiConfig, UiDriverKind};
pub use contract::ContractValidator;
pub use error::{Error, FailureKind, Result};
pub use executor::TraceExecutor;
pub use explorer::{ExploreOutcome, Explorer, ExplorerOptions, StopReason, TraceCompiler};
pub use interpolation::InterpolationContext;
pub use llm::{LanguageModel, LlmClient};
pub use manifest::{verify_run, RunManifest, VerifyReport};
pub use report::{generate_report, RunSummary};
pub use session::{replay, replay_file, RunOutcome, RunSession, SessionOptions};
pub use trace::{Action, Step, Trace, TraceKind};
pub use transport::RemoteChannel;
