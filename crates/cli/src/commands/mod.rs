//! CLI Commands

pub mod explore;
pub mod list;
pub mod replay;
pub mod report;
pub mod verify;

use atf_core::StepRecord;
use serde::Serialize;

use crate::output::TableDisplay;

/// Step record display wrapper
#[derive(Serialize)]
pub struct StepDisplay {
    pub step: String,
    pub action: String,
    pub status: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: String,
}

impl From<&StepRecord> for StepDisplay {
    fn from(record: &StepRecord) -> Self {
        Self {
            step: record.step_id.clone(),
            action: record.action.to_string(),
            status: if record.passed() { "pass" } else { "fail" }.to_string(),
            attempts: record.attempts,
            duration_ms: record.duration_ms,
            error: record.error.clone().unwrap_or_default(),
        }
    }
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["STEP", "ACTION", "STATUS", "ATTEMPTS", "DURATION", "ERROR"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.step.clone(),
            self.action.clone(),
            self.status.clone(),
            self.attempts.to_string(),
            format!("{}ms", self.duration_ms),
            self.error.clone(),
        ]
    }
}
