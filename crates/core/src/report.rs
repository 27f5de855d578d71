//! Human-readable run summaries
//!
//! Built only from files already in the run directory (`run.json`,
//! `steps.jsonl`, `verdict.json`), so regenerating a report for a finished
//! run reproduces the same bytes.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::info;

use crate::artifacts::{RunVerdict, Status, StepRecord};
use crate::error::{Error, FailureKind, Result};
use crate::trace::Action;

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_HTML: &str = "summary.html";

/// Contents of `summary.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub mode: String,
    pub app: String,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub verdict: Status,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    pub total_steps: usize,
    /// Sum of step durations
    pub duration_ms: u64,
    pub failed_steps: Vec<FailedStep>,
    pub artifacts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub step_id: String,
    pub action: Action,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// Write `summary.json` and `summary.html` for a finalized run
pub async fn generate_report(run_dir: &Path) -> Result<RunSummary> {
    if !run_dir.join("verdict.json").is_file() {
        return Err(Error::RunNotFound(format!(
            "{} has no verdict.json",
            run_dir.display()
        )));
    }

    let run: Value = serde_json::from_slice(&fs::read(run_dir.join("run.json")).await?)?;
    let verdict: RunVerdict = serde_json::from_slice(&fs::read(run_dir.join("verdict.json")).await?)?;
    let steps = read_steps(&run_dir.join("steps.jsonl")).await?;

    let summary = summarize(&run, &verdict, &steps);
    fs::write(run_dir.join(SUMMARY_JSON), serde_json::to_vec_pretty(&summary)?).await?;
    fs::write(run_dir.join(SUMMARY_HTML), render_html(&summary, &steps)).await?;

    info!("Report for run {} written to {}", summary.run_id, run_dir.display());
    Ok(summary)
}

async fn read_steps(path: &Path) -> Result<Vec<StepRecord>> {
    let content = fs::read_to_string(path).await?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

fn summarize(run: &Value, verdict: &RunVerdict, steps: &[StepRecord]) -> RunSummary {
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();

    let failed_steps = steps
        .iter()
        .filter(|s| !s.passed())
        .map(|s| FailedStep {
            step_id: s.step_id.clone(),
            action: s.action,
            attempts: s.attempts,
            failure_kind: s.failure_kind,
            error: s.error.clone(),
            artifacts: s.artifacts.clone(),
        })
        .collect();

    let artifacts = [
        ("run", "run.json"),
        ("steps", "steps.jsonl"),
        ("logs", "logs.jsonl"),
        ("verdict", "verdict.json"),
        ("manifest", "manifest.json"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    RunSummary {
        run_id: text(&run["runId"]),
        mode: text(&run["mode"]),
        app: text(&run["trace"]["app"]),
        test_name: text(&run["trace"]["testName"]),
        started_at: run["startedAt"].as_str().map(str::to_string),
        verdict: verdict.status,
        reasons: verdict.reasons.clone(),
        failed_step_id: verdict.failed_step_id.clone(),
        total_steps: steps.len(),
        duration_ms: steps.iter().map(|s| s.duration_ms).sum(),
        failed_steps,
        artifacts,
    }
}

fn status_label(status: Status) -> (&'static str, &'static str) {
    match status {
        Status::Pass => ("pass", "PASS"),
        Status::Fail => ("fail", "FAIL"),
    }
}

fn render_html(summary: &RunSummary, steps: &[StepRecord]) -> String {
    let (class, label) = status_label(summary.verdict);
    let mut html = String::new();

    let _ = write!(
        html,
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Run Report: {run_id}</title>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 800px; margin: 0 auto; padding: 20px; }}
.pass {{ color: green; }}
.fail {{ color: red; }}
.step {{ border: 1px solid #ccc; margin: 10px 0; padding: 10px; border-radius: 4px; }}
.error {{ background: #fee; color: #c00; padding: 10px; }}
</style>
</head>
<body>
<h1>Run Report: {run_id}</h1>
<div>
<strong>App:</strong> {app}<br>
<strong>Test:</strong> {test}<br>
<strong>Mode:</strong> {mode}<br>
<strong>Verdict:</strong> <span class="{class}">{label}</span><br>
<strong>Steps:</strong> {total}<br>
<strong>Duration:</strong> {duration}ms
</div>
"#,
        run_id = escape(&summary.run_id),
        app = escape(&summary.app),
        test = escape(&summary.test_name),
        mode = escape(&summary.mode),
        total = summary.total_steps,
        duration = summary.duration_ms,
    );

    if !summary.reasons.is_empty() {
        html.push_str("<div class=\"error\"><h3>Failures:</h3><ul>");
        for reason in &summary.reasons {
            let _ = write!(html, "<li>{}</li>", escape(reason));
        }
        html.push_str("</ul></div>\n");
    }

    html.push_str("<h2>Steps</h2>\n");
    for step in steps {
        let (class, label) = status_label(step.status);
        let _ = write!(
            html,
            "<div class=\"step\"><strong>{}</strong> {} <code>{}</code> <span class=\"{}\">{}</span> ({}ms, {} attempt{})",
            escape(&step.step_id),
            step.action,
            escape(&step.selector_or_endpoint),
            class,
            label,
            step.duration_ms,
            step.attempts,
            if step.attempts == 1 { "" } else { "s" },
        );
        if let Some(error) = &step.error {
            let _ = write!(html, "<pre>{}</pre>", escape(error));
        }
        for (kind, path) in &step.artifacts {
            let _ = write!(html, "<br><a href=\"{}\">{}</a>", escape(path), escape(kind));
        }
        html.push_str("</div>\n");
    }

    html.push_str("<h2>Artifacts</h2>\n<ul>");
    for (kind, path) in &summary.artifacts {
        let _ = write!(html, "<li><a href=\"{}\">{}</a></li>", escape(path), escape(kind));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn step(id: &str, status: Status, duration_ms: u64) -> StepRecord {
        let failed = status == Status::Fail;
        StepRecord {
            step_id: id.to_string(),
            action: Action::Click,
            status,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            duration_ms,
            attempts: if failed { 2 } else { 1 },
            error: failed.then(|| "Element <button> not found".to_string()),
            failure_kind: failed.then_some(FailureKind::DriverError),
            selector_or_endpoint: "#buy".to_string(),
            input: None,
            expected: None,
            guards: None,
            artifacts: if failed {
                BTreeMap::from([("screenshot".to_string(), format!("ui/{id}-1.png"))])
            } else {
                BTreeMap::new()
            },
        }
    }

    fn write_run(dir: &Path, steps: &[StepRecord], verdict: &RunVerdict) {
        let run = json!({
            "runId": "replay_1_abcdef",
            "mode": "replay",
            "trace": { "app": "shop", "testName": "checkout", "type": "ui" },
            "startedAt": "2026-01-01T00:00:00Z",
        });
        std::fs::write(dir.join("run.json"), serde_json::to_vec(&run).unwrap()).unwrap();
        let lines: String = steps
            .iter()
            .map(|s| serde_json::to_string(s).unwrap() + "\n")
            .collect();
        std::fs::write(dir.join("steps.jsonl"), lines).unwrap();
        std::fs::write(dir.join("verdict.json"), serde_json::to_vec(verdict).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_failed_run_summary() {
        let dir = TempDir::new().unwrap();
        let steps = [step("s1", Status::Pass, 40), step("s2", Status::Fail, 60)];
        write_run(
            dir.path(),
            &steps,
            &RunVerdict::fail("Element <button> not found", Some("s2".to_string())),
        );

        let summary = generate_report(dir.path()).await.unwrap();
        assert_eq!(summary.verdict, Status::Fail);
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.duration_ms, 100);
        assert_eq!(summary.failed_step_id.as_deref(), Some("s2"));
        assert_eq!(summary.failed_steps.len(), 1);
        assert_eq!(summary.failed_steps[0].step_id, "s2");
        assert_eq!(summary.failed_steps[0].failure_kind, Some(FailureKind::DriverError));

        let json: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(SUMMARY_JSON)).unwrap()).unwrap();
        assert_eq!(json["verdict"], "fail");
        assert_eq!(json["totalSteps"], 2);
        assert_eq!(json["failedSteps"][0]["artifacts"]["screenshot"], "ui/s2-1.png");

        let html = std::fs::read_to_string(dir.path().join(SUMMARY_HTML)).unwrap();
        assert!(html.contains("<span class=\"fail\">FAIL</span>"));
        assert!(html.contains("<a href=\"ui/s2-1.png\">screenshot</a>"));
        assert!(html.contains("Element &lt;button&gt; not found"));
        assert!(!html.contains("<button>"));
    }

    #[tokio::test]
    async fn test_regeneration_is_stable() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), &[step("s1", Status::Pass, 5)], &RunVerdict::pass());

        generate_report(dir.path()).await.unwrap();
        let first = std::fs::read(dir.path().join(SUMMARY_HTML)).unwrap();
        generate_report(dir.path()).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join(SUMMARY_HTML)).unwrap(), first);
    }

    #[tokio::test]
    async fn test_unfinished_run_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = generate_report(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::RunNotFound(_)));
    }
}
