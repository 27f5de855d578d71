//! Browser session drivers
//!
//! This module provides one capability surface with two implementations:
//! - `RemoteBrowser` drives Playwright in a Node worker over [`RemoteChannel`]
//! - `MockBrowser` simulates pages in-process (testing and hosts without Node)
//!
//! [`RemoteChannel`]: crate::transport::RemoteChannel

mod mock;
mod remote;

pub use mock::{MockBrowser, MockElement, MockPage};
pub use remote::RemoteBrowser;

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::{UiConfig, UiDriverKind};
use crate::error::{Error, Result};

/// Default wait for page text when a step sets no timeout
pub const DEFAULT_TEXT_TIMEOUT_MS: u64 = 5_000;

/// Maximum characters of element text reported in observations
pub const ELEMENT_TEXT_LIMIT: usize = 120;

/// An element carrying a stable `data-testid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSummary {
    pub test_id: String,
    pub text: String,
}

const ELEMENTS_SCRIPT: &str = r#"(limit) => Array.from(document.querySelectorAll("[data-testid]"))
    .slice(0, limit)
    .map((node) => ({
        testId: node.getAttribute("data-testid"),
        text: (node.innerText || "").trim()
    }))"#;

/// A browser session
///
/// Both implementations honour the same contract so the executor never needs
/// to know which one is active.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Implementation identifier ("remote", "simulated")
    fn kind(&self) -> &'static str;

    async fn start(&self, base_url: &str, headless: bool) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn goto(&self, url: &str) -> Result<()>;

    async fn click(&self, selector: &str) -> Result<()>;

    /// Clear the field, then type `text`
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    async fn select(&self, selector: &str, value: &str) -> Result<()>;

    async fn press(&self, selector: &str, key: &str) -> Result<()>;

    async fn wait_for_selector(&self, selector: &str, timeout_ms: Option<u64>) -> Result<()>;

    async fn wait_for_text(&self, text: &str, timeout_ms: Option<u64>) -> Result<()>;

    /// Trimmed text content of the first matching element
    async fn extract_text(&self, selector: &str) -> Result<String>;

    async fn screenshot(&self, path: &Path) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// Raw text content of a selector; `"body"` gives the whole page
    async fn text_content(&self, selector: &str) -> Result<String>;

    async fn evaluate(&self, source: &str, arg: Value) -> Result<Value>;

    /// Up to `limit` elements with a `data-testid`, text truncated
    async fn interactable_elements(&self, limit: usize) -> Result<Vec<ElementSummary>> {
        let raw = self.evaluate(ELEMENTS_SCRIPT, json!(limit)).await?;
        let mut elements: Vec<ElementSummary> = serde_json::from_value(raw)?;
        for element in &mut elements {
            element.text = truncate_chars(&element.text, ELEMENT_TEXT_LIMIT);
        }
        Ok(elements)
    }
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Check whether the Node runtime is available
pub fn node_available(node_binary: &str) -> bool {
    std::process::Command::new(node_binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Create the browser driver for a run; the choice is made once.
///
/// The simulated browser is only used when configured explicitly.
pub fn launch(config: &UiConfig) -> Result<Box<dyn BrowserDriver>> {
    debug!("Launching {:?} browser driver", config.driver);
    match config.driver {
        UiDriverKind::Auto if !node_available(&config.node_binary) => Err(Error::Driver(format!(
            "browser automation unavailable: '{}' not found",
            config.node_binary
        ))),
        UiDriverKind::Auto | UiDriverKind::Remote => Ok(Box::new(RemoteBrowser::spawn(config)?)),
        UiDriverKind::Simulated => {
            info!("Using the simulated browser");
            Ok(Box::new(MockBrowser::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_missing_node_is_driver_error() {
        let config = UiConfig {
            node_binary: "/nonexistent/node-binary".to_string(),
            ..Default::default()
        };
        let err = launch(&config).err().unwrap();
        assert!(matches!(err, Error::Driver(_)));
        assert!(err.to_string().contains("/nonexistent/node-binary"));
    }

    #[test]
    fn test_simulated_only_when_configured() {
        let config = UiConfig {
            driver: UiDriverKind::Simulated,
            node_binary: "/nonexistent/node-binary".to_string(),
            ..Default::default()
        };
        assert_eq!(launch(&config).unwrap().kind(), "simulated");
    }

    #[test]
    fn test_element_summary_wire_shape() {
        let raw = json!([{ "testId": "login-button", "text": "Log in" }]);
        let parsed: Vec<ElementSummary> = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed[0].test_id, "login-button");
    }
}
