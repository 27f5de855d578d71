//! LLM providers used by the explorer

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};

/// A text-completion backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name recorded in generated traces
    fn provider(&self) -> &str;

    /// Model name recorded in generated traces
    fn model(&self) -> &str;

    /// Produce a completion for a system and user prompt
    async fn generate(&self, system: &str, user: &str) -> Result<String>;
}

/// HTTP client for Ollama and OpenAI-compatible endpoints
pub struct LlmClient {
    config: LlmConfig,
    client: Client,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("config", &self.config)
            .field("client", &"[REDACTED]")
            .finish()
    }
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Llm(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url().trim_end_matches('/'), path)
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value> {
        trace!("LLM -> {}: {}", url, body);
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| Error::Llm(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Llm(format!("status {}", status.as_u16())));
        }
        response.json().await.map_err(|e| Error::Llm(e.to_string()))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn provider(&self) -> &str {
        self.config.provider.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, system: &str, user: &str) -> Result<String> {
        debug!("Requesting completion from {} ({})", self.config.provider, self.config.model);

        let content = match self.config.provider {
            LlmProvider::Ollama => {
                let body = json!({
                    "model": self.config.model,
                    "system": system,
                    "prompt": user,
                    "stream": false,
                    "format": "json",
                });
                let reply = self.post(&self.endpoint("/api/generate"), &body).await?;
                reply.get("response").and_then(Value::as_str).map(str::to_string)
            }
            LlmProvider::OpenaiCompat => {
                let body = json!({
                    "model": self.config.model,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                    "response_format": { "type": "json_object" },
                });
                let reply = self.post(&self.endpoint("/chat/completions"), &body).await?;
                reply
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
        };

        content.ok_or_else(|| Error::Llm("response carried no completion text".to_string()))
    }
}
