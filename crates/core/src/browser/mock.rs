//! In-process simulated browser
//!
//! Pages are declared up front as a map of path to [`MockPage`]. Selectors are
//! matched against each element's declared selector, its `data-testid`
//! (`[data-testid=x]`, `[data-testid="x"]`) or its text (`text=...`).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::{ImageBuffer, Rgb};
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::Value;
use tracing::trace;

use super::{truncate_chars, BrowserDriver, ElementSummary, ELEMENT_TEXT_LIMIT};
use crate::error::{Error, Result};

/// One element on a simulated page
#[derive(Debug, Clone, Default)]
pub struct MockElement {
    /// CSS-like selector this element answers to, e.g. `#username`
    pub selector: String,
    pub test_id: Option<String>,
    pub text: String,
    /// Path loaded when the element is clicked (or Enter is pressed on it)
    pub navigates_to: Option<String>,
    /// Allowed values for `select`; empty means any value
    pub options: Vec<String>,
}

impl MockElement {
    pub fn new(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Element addressed by `data-testid`
    pub fn test_id(test_id: impl Into<String>, text: impl Into<String>) -> Self {
        let test_id = test_id.into();
        Self {
            selector: format!("[data-testid=\"{test_id}\"]"),
            test_id: Some(test_id),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn navigates_to(mut self, path: impl Into<String>) -> Self {
        self.navigates_to = Some(path.into());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        if selector == self.selector {
            return true;
        }
        if let Some(text) = selector.strip_prefix("text=") {
            return self.text.contains(text.trim_matches('"'));
        }
        if let Some(inner) = selector
            .strip_prefix("[data-testid=")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            let wanted = inner.trim_matches(|c| c == '"' || c == '\'');
            return self.test_id.as_deref() == Some(wanted);
        }
        false
    }
}

/// A simulated page
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub title: String,
    /// Static body text in addition to element texts
    pub text: String,
    pub elements: Vec<MockElement>,
}

impl MockPage {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn element(mut self, element: MockElement) -> Self {
        self.elements.push(element);
        self
    }

    fn body_text(&self) -> String {
        let mut parts = Vec::with_capacity(self.elements.len() + 1);
        if !self.text.is_empty() {
            parts.push(self.text.as_str());
        }
        parts.extend(self.elements.iter().map(|e| e.text.as_str()));
        parts.join("\n")
    }
}

#[derive(Debug, Default)]
struct MockState {
    pages: BTreeMap<String, MockPage>,
    base_url: Option<Url>,
    current_url: Option<Url>,
    started: bool,
    typed: HashMap<String, String>,
    selected: HashMap<String, String>,
    /// Remaining forced failures per selector
    failures: HashMap<String, u32>,
    actions: Vec<String>,
}

impl MockState {
    fn ensure_started(&self) -> Result<()> {
        if self.started {
            Ok(())
        } else {
            Err(Error::Driver("browser session not started".to_string()))
        }
    }

    /// The loaded page, or `None` while still on `about:blank`
    fn loaded_page(&self) -> Result<Option<&MockPage>> {
        self.ensure_started()?;
        match &self.current_url {
            Some(_) => self.page().map(Some),
            None => Ok(None),
        }
    }

    fn page(&self) -> Result<&MockPage> {
        self.ensure_started()?;
        let url = self
            .current_url
            .as_ref()
            .ok_or_else(|| Error::Driver("no page loaded".to_string()))?;
        self.pages
            .get(url.path())
            .ok_or_else(|| Error::Driver(format!("no page at {}", url.path())))
    }

    fn element(&mut self, selector: &str) -> Result<MockElement> {
        if let Some(remaining) = self.failures.get_mut(selector) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Driver(format!("element {selector} is not attached")));
            }
        }
        self.page()?
            .elements
            .iter()
            .find(|e| e.matches(selector))
            .cloned()
            .ok_or_else(|| Error::Driver(format!("no element matches selector {selector}")))
    }

    fn navigate(&mut self, target: &str) -> Result<()> {
        self.ensure_started()?;
        let url = match Url::parse(target) {
            Ok(url) => url,
            Err(_) => self
                .base_url
                .as_ref()
                .ok_or_else(|| Error::Driver(format!("cannot resolve relative URL {target}")))?
                .join(target)
                .map_err(|e| Error::Driver(format!("invalid URL {target}: {e}")))?,
        };
        if !self.pages.contains_key(url.path()) {
            return Err(Error::Driver(format!("navigation to {url} failed: 404")));
        }
        trace!("simulated navigate -> {}", url);
        self.current_url = Some(url);
        Ok(())
    }
}

/// Simulated browser session; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct MockBrowser {
    state: Arc<Mutex<MockState>>,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page at a path such as `/login`
    pub fn with_page(self, path: impl Into<String>, page: MockPage) -> Self {
        self.state.lock().pages.insert(path.into(), page);
        self
    }

    /// Make the next `times` lookups of `selector` fail
    pub fn fail_times(self, selector: impl Into<String>, times: u32) -> Self {
        self.state.lock().failures.insert(selector.into(), times);
        self
    }

    /// Last value typed into a field
    pub fn typed_value(&self, selector: &str) -> Option<String> {
        self.state.lock().typed.get(selector).cloned()
    }

    pub fn selected_value(&self, selector: &str) -> Option<String> {
        self.state.lock().selected.get(selector).cloned()
    }

    /// Every action performed, as `"<cmd> <target>"`
    pub fn actions(&self) -> Vec<String> {
        self.state.lock().actions.clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn record(&self, state: &mut MockState, action: String) {
        trace!("simulated {}", action);
        state.actions.push(action);
    }
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn start(&self, base_url: &str, _headless: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.base_url = Some(
            Url::parse(base_url)
                .map_err(|e| Error::Driver(format!("invalid base URL {base_url}: {e}")))?,
        );
        state.current_url = None;
        state.started = true;
        self.record(&mut state, format!("start {base_url}"));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.started = false;
        self.record(&mut state, "stop".to_string());
        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.navigate(url)?;
        self.record(&mut state, format!("goto {url}"));
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(selector)?;
        self.record(&mut state, format!("click {selector}"));
        if let Some(target) = &element.navigates_to {
            state.navigate(target)?;
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.element(selector)?;
        state.typed.insert(selector.to_string(), text.to_string());
        self.record(&mut state, format!("type {selector}"));
        Ok(())
    }

    async fn select(&self, selector: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(selector)?;
        if !element.options.is_empty() && !element.options.iter().any(|o| o == value) {
            return Err(Error::Driver(format!("option '{value}' not found in {selector}")));
        }
        state.selected.insert(selector.to_string(), value.to_string());
        self.record(&mut state, format!("select {selector}"));
        Ok(())
    }

    async fn press(&self, selector: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let element = state.element(selector)?;
        self.record(&mut state, format!("press {selector} {key}"));
        if key == "Enter" {
            if let Some(target) = &element.navigates_to {
                state.navigate(target)?;
            }
        }
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout_ms: Option<u64>) -> Result<()> {
        let mut state = self.state.lock();
        state.element(selector).map(|_| ()).map_err(|_| {
            Error::Driver(format!(
                "timeout {}ms exceeded waiting for {selector}",
                timeout_ms.unwrap_or_default()
            ))
        })
    }

    async fn wait_for_text(&self, text: &str, timeout_ms: Option<u64>) -> Result<()> {
        let state = self.state.lock();
        if state.page()?.body_text().contains(text) {
            Ok(())
        } else {
            Err(Error::Driver(format!(
                "timeout {}ms exceeded waiting for text \"{text}\"",
                timeout_ms.unwrap_or(super::DEFAULT_TEXT_TIMEOUT_MS)
            )))
        }
    }

    async fn extract_text(&self, selector: &str) -> Result<String> {
        let mut state = self.state.lock();
        Ok(state.element(selector)?.text.trim().to_string())
    }

    async fn screenshot(&self, path: &Path) -> Result<()> {
        self.state.lock().ensure_started()?;
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(320, 200, Rgb([240, 240, 240]));
        img.save(path)
            .map_err(|e| Error::Driver(format!("failed to write screenshot: {e}")))
    }

    async fn current_url(&self) -> Result<String> {
        let state = self.state.lock();
        state.ensure_started()?;
        Ok(state
            .current_url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&self) -> Result<String> {
        let state = self.state.lock();
        Ok(state
            .loaded_page()?
            .map(|p| p.title.clone())
            .unwrap_or_default())
    }

    async fn text_content(&self, selector: &str) -> Result<String> {
        let mut state = self.state.lock();
        if selector.trim() == "body" {
            return Ok(state.loaded_page()?.map(MockPage::body_text).unwrap_or_default());
        }
        Ok(state.element(selector)?.text)
    }

    async fn evaluate(&self, _source: &str, _arg: Value) -> Result<Value> {
        Err(Error::Driver(
            "script evaluation is not available in the simulated browser".to_string(),
        ))
    }

    async fn interactable_elements(&self, limit: usize) -> Result<Vec<ElementSummary>> {
        let state = self.state.lock();
        let Some(page) = state.loaded_page()? else {
            return Ok(Vec::new());
        };
        Ok(page
            .elements
            .iter()
            .filter_map(|e| {
                e.test_id.as_ref().map(|id| ElementSummary {
                    test_id: id.clone(),
                    text: truncate_chars(e.text.trim(), ELEMENT_TEXT_LIMIT),
                })
            })
            .take(limit)
            .collect())
    }
}
