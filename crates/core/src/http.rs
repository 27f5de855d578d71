//! Stateless HTTP driver

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Request timeout when the trace sets no per-attempt limit
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One outgoing request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Build a request from a step's resolved input.
    ///
    /// An object carrying any of `body`, `headers` or `query` is treated as an
    /// envelope; anything else is the body itself.
    pub fn from_input(method: Method, path: impl Into<String>, input: Option<&Value>) -> Self {
        let mut request = HttpRequest {
            method,
            path: path.into(),
            ..Default::default()
        };

        match input {
            Some(Value::Object(map))
                if map.contains_key("body") || map.contains_key("headers") || map.contains_key("query") =>
            {
                request.body = map.get("body").cloned();
                request.headers = string_map(map.get("headers"));
                request.query = string_map(map.get("query"));
            }
            Some(Value::Null) | None => {}
            Some(other) => request.body = Some(other.clone()),
        }

        request
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Request side of a recorded exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A completed request/response pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpExchange {
    pub request: RecordedRequest,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON, or the raw text when the body is not JSON
    pub body: Value,
    pub duration_ms: u64,
    pub url: String,
}

/// HTTP driver bound to an API base URL
#[derive(Debug, Clone)]
pub struct HttpDriver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDriver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Driver(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Resolve a path against the base URL with URL-join semantics
    pub fn url_for(&self, path: &str, query: &BTreeMap<String, String>) -> Result<Url> {
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::Driver(format!("invalid API base URL '{}': {e}", self.base_url)))?;
        let mut url = base
            .join(path)
            .map_err(|e| Error::Driver(format!("invalid endpoint '{path}': {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Send a request and capture the exchange
    pub async fn send(&self, request: &HttpRequest) -> Result<HttpExchange> {
        let url = self.url_for(&request.path, &request.query)?;

        let mut sent_headers = BTreeMap::new();
        if !request.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            sent_headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        sent_headers.extend(request.headers.clone());

        let mut header_map = HeaderMap::new();
        header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Driver(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Driver(format!("invalid header value for '{name}': {e}")))?;
            header_map.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .headers(header_map);
        match &request.body {
            Some(Value::String(raw)) => builder = builder.body(raw.clone()),
            Some(Value::Null) | None => {}
            Some(other) => builder = builder.body(serde_json::to_vec(other)?),
        }

        debug!("{} {}", request.method, url);
        let start = Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let text = response.text().await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        debug!("{} {} -> {} in {}ms", request.method, url, status, duration_ms);

        Ok(HttpExchange {
            request: RecordedRequest {
                method: request.method.to_string(),
                path: request.path.clone(),
                headers: sent_headers,
                body: request.body.clone(),
            },
            status,
            headers,
            body,
            duration_ms,
            url: url.to_string(),
        })
    }
}
