//! Placeholder resolution for step fields
//!
//! Supported tokens:
//!
//! | Token | Source |
//! |-------|--------|
//! | `${baseUrl}` | trace UI base URL |
//! | `${apiBaseUrl}` | trace API base URL |
//! | `${ENV:NAME}` | declared environment inputs |
//! | `${STATE:path}` | values captured earlier in the run |
//!
//! Resolution is all-or-nothing: a missing binding fails the whole template.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::error::{BindingKind, Error, Result};

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{(?:(baseUrl)|(apiBaseUrl)|ENV:([A-Za-z0-9_]+)|STATE:([A-Za-z0-9_.\-\[\]]+))\}")
        .expect("token pattern compiles")
});

/// Values visible to placeholders during one run
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    pub base_url: String,
    pub api_base_url: String,
    env: BTreeMap<String, String>,
    state: Map<String, Value>,
}

impl InterpolationContext {
    /// Build a context for a trace.
    ///
    /// Every declared key is bound. An empty declared value is filled from the
    /// process environment variable of the same name, if set.
    pub fn new(
        base_url: impl Into<String>,
        api_base_url: impl Into<String>,
        declared_env: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_base_url: api_base_url.into(),
            env: seed_env(declared_env),
            state: Map::new(),
        }
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Record a captured value under `key`
    pub fn save_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// Resolve all tokens in a string
    pub fn resolve(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in TOKEN.captures_iter(template) {
            let whole = caps.get(0).expect("capture 0 always present");
            out.push_str(&template[last..whole.start()]);
            out.push_str(&self.binding(&caps)?);
            last = whole.end();
        }

        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Resolve tokens in every string leaf of a JSON value
    pub fn resolve_deep(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.resolve(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_deep(item))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, entry) in map {
                    resolved.insert(key.clone(), self.resolve_deep(entry)?);
                }
                Value::Object(resolved)
            }
            other => other.clone(),
        })
    }

    fn binding(&self, caps: &Captures<'_>) -> Result<String> {
        if caps.get(1).is_some() {
            return Ok(self.base_url.clone());
        }
        if caps.get(2).is_some() {
            return Ok(self.api_base_url.clone());
        }
        if let Some(key) = caps.get(3) {
            return self.env.get(key.as_str()).cloned().ok_or_else(|| Error::MissingBinding {
                kind: BindingKind::Env,
                key: key.as_str().to_string(),
            });
        }

        let path = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
        match lookup_path(&self.state, path) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(Error::MissingBinding {
                kind: BindingKind::State,
                key: path.to_string(),
            }),
            Some(other) => Ok(other.to_string()),
        }
    }
}

/// Declared environment inputs with empty values filled from the process
pub fn seed_env(declared_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    declared_env
        .iter()
        .map(|(key, value)| {
            let value = if value.is_empty() {
                std::env::var(key).unwrap_or_default()
            } else {
                value.clone()
            };
            (key.clone(), value)
        })
        .collect()
}

/// Look up a dotted path (`a.b.0.c` or `a.b[0].c`) in a JSON object
pub fn lookup_path<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = split_path(path).into_iter();
    let first = segments.next()?;
    let mut current = root.get(&first)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Like [`lookup_path`] but starting from any JSON value
pub fn lookup_value<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    match root {
        Value::Object(map) => lookup_path(map, path),
        Value::Array(items) => {
            let mut segments = split_path(path);
            if segments.is_empty() {
                return None;
            }
            let head = segments.remove(0);
            let item = items.get(head.parse::<usize>().ok()?)?;
            if segments.is_empty() {
                Some(item)
            } else {
                lookup_value(item, &segments.join("."))
            }
        }
        _ => None,
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.replace('[', ".")
        .replace(']', "")
        .split('.')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
