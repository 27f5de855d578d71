//! Playwright driven from a Node worker process

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

use super::{BrowserDriver, DEFAULT_TEXT_TIMEOUT_MS};
use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::transport::RemoteChannel;

/// Worker script shipped with the crate
const WORKER_SCRIPT: &str = include_str!("../../assets/ui-helper.mjs");

/// Browser session hosted by a Node + Playwright worker
pub struct RemoteBrowser {
    channel: RemoteChannel,
    /// Holds the extracted worker script for the lifetime of the session
    _script_dir: Option<TempDir>,
}

impl RemoteBrowser {
    /// Spawn the worker configured in `config`
    pub fn spawn(config: &UiConfig) -> Result<Self> {
        let (script_path, script_dir) = match &config.helper_script {
            Some(path) => (path.clone(), None),
            None => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join("ui-helper.mjs");
                std::fs::write(&path, WORKER_SCRIPT)?;
                (path, Some(dir))
            }
        };

        debug!("Starting browser worker: {} {}", config.node_binary, script_path.display());
        let mut command = Command::new(&config.node_binary);
        command.arg(&script_path);

        let channel = RemoteChannel::spawn(
            command,
            Duration::from_millis(config.request_timeout_ms),
        )?;

        Ok(Self {
            channel,
            _script_dir: script_dir,
        })
    }

    /// Use an existing channel, e.g. one connected to a custom worker
    pub fn with_channel(channel: RemoteChannel) -> Self {
        Self {
            channel,
            _script_dir: None,
        }
    }

    async fn call_unit(&self, cmd: &str, params: Value) -> Result<()> {
        self.channel.request(cmd, params).await.map(|_| ())
    }

    async fn call_string(&self, cmd: &str, params: Value) -> Result<String> {
        match self.channel.request(cmd, params).await? {
            Value::String(s) => Ok(s),
            Value::Null => Ok(String::new()),
            other => Err(Error::Driver(format!("'{cmd}' returned non-string {other}"))),
        }
    }
}

#[async_trait]
impl BrowserDriver for RemoteBrowser {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn start(&self, base_url: &str, headless: bool) -> Result<()> {
        self.call_unit("start", json!({ "baseUrl": base_url, "headless": headless }))
            .await
    }

    async fn stop(&self) -> Result<()> {
        let stopped = if self.channel.is_closed() {
            Ok(())
        } else {
            self.call_unit("stop", json!({})).await
        };
        self.channel.kill().await?;
        stopped
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.call_unit("goto", json!({ "url": url })).await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.call_unit("click", json!({ "selector": selector })).await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.call_unit("type", json!({ "selector": selector, "text": text }))
            .await
    }

    async fn select(&self, selector: &str, value: &str) -> Result<()> {
        self.call_unit("select", json!({ "selector": selector, "value": value }))
            .await
    }

    async fn press(&self, selector: &str, key: &str) -> Result<()> {
        self.call_unit("press", json!({ "selector": selector, "key": key }))
            .await
    }

    async fn wait_for_selector(&self, selector: &str, timeout_ms: Option<u64>) -> Result<()> {
        self.call_unit(
            "waitForSelector",
            json!({ "selector": selector, "timeout": timeout_ms }),
        )
        .await
    }

    async fn wait_for_text(&self, text: &str, timeout_ms: Option<u64>) -> Result<()> {
        let timeout = timeout_ms.unwrap_or(DEFAULT_TEXT_TIMEOUT_MS);
        self.call_unit("waitForText", json!({ "text": text, "timeout": timeout }))
            .await
    }

    async fn extract_text(&self, selector: &str) -> Result<String> {
        self.call_string("extractText", json!({ "selector": selector }))
            .await
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.call_unit("screenshot", json!({ "path": path })).await
    }

    async fn current_url(&self) -> Result<String> {
        self.call_string("url", json!({})).await
    }

    async fn title(&self) -> Result<String> {
        self.call_string("title", json!({})).await
    }

    async fn text_content(&self, selector: &str) -> Result<String> {
        self.call_string("textContent", json!({ "selector": selector }))
            .await
    }

    async fn evaluate(&self, source: &str, arg: Value) -> Result<Value> {
        self.channel
            .request("evaluate", json!({ "source": source, "arg": arg }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Answers every request with a canned result keyed by command
    fn fake_worker() -> RemoteBrowser {
        let (near, far) = duplex(16 * 1024);
        let (r, w) = split(near);
        let channel = RemoteChannel::new(r, w, Duration::from_secs(5));

        let (far_r, mut far_w) = split(far);
        tokio::spawn(async move {
            let mut lines = BufReader::new(far_r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let result = match req["cmd"].as_str().unwrap() {
                    "url" => json!("http://localhost:3010/dashboard"),
                    "title" => json!("Dashboard"),
                    "extractText" => json!(format!("text of {}", req["selector"].as_str().unwrap())),
                    "evaluate" => json!([
                        { "testId": "cart", "text": "x".repeat(200) },
                        { "testId": "logout", "text": "Log out" }
                    ]),
                    "waitForText" => json!(req["timeout"]),
                    _ => Value::Null,
                };
                let reply = json!({ "id": req["id"], "ok": true, "result": result });
                far_w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        RemoteBrowser::with_channel(channel)
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let browser = fake_worker();
        browser.start("http://localhost:3010", true).await.unwrap();
        browser.goto("/dashboard").await.unwrap();
        assert_eq!(browser.current_url().await.unwrap(), "http://localhost:3010/dashboard");
        assert_eq!(browser.title().await.unwrap(), "Dashboard");
        assert_eq!(
            browser.extract_text("[data-testid=total]").await.unwrap(),
            "text of [data-testid=total]"
        );
    }

    #[tokio::test]
    async fn test_interactable_elements_are_truncated() {
        let browser = fake_worker();
        let elements = browser.interactable_elements(15).await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].text.chars().count(), 120);
        assert_eq!(elements[1].test_id, "logout");
    }
}
