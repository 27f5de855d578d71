//! Secret redaction for persisted evidence

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Replacement written in place of a secret
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Secrets shorter than this are left alone
pub const MIN_SECRET_LEN: usize = 4;

/// Header names that are always masked
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "api-key",
];

/// Masks declared secret values and sensitive headers
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Replace every secret occurrence inside a string
    pub fn redact_str(&self, input: &str) -> String {
        self.secrets
            .iter()
            .fold(input.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTION_MARKER))
    }

    /// Redact string leaves and object keys throughout a JSON value
    pub fn redact_value(&self, value: &Value) -> Value {
        if self.secrets.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, entry) in map {
                    out.insert(self.redact_str(key), self.redact_value(entry));
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Mask sensitive header names and secret values in the rest
    pub fn redact_headers(&self, headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let value = if is_sensitive_header(name) {
                    REDACTION_MARKER.to_string()
                } else {
                    self.redact_str(value)
                };
                (name.clone(), value)
            })
            .collect()
    }
}

pub fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str())
}
