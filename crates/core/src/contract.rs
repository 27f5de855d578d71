//! OpenAPI response contract checks

use std::path::Path;

use jsonschema::JSONSchema;
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Validates HTTP responses against an OpenAPI document
#[derive(Debug, Clone)]
pub struct ContractValidator {
    document: Value,
}

impl ContractValidator {
    /// Load a JSON or YAML OpenAPI document
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let document = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => yaml_to_json(serde_yaml::from_str(&content)?),
        };
        debug!("Loaded contract {}", path.display());
        Ok(Self { document })
    }

    pub fn from_value(document: Value) -> Self {
        Self { document }
    }

    /// Find the operation for a method and request path.
    ///
    /// Exact path keys win over templated ones such as `/items/{id}`. Query
    /// strings and the scheme/host of absolute URLs are ignored.
    pub fn find_operation(&self, method: &str, endpoint: &str) -> Option<&Value> {
        let paths = self.document.get("paths")?.as_object()?;
        let path = request_path(endpoint);
        let method = method.to_ascii_lowercase();

        if let Some(op) = paths.get(&path).and_then(|item| item.get(&method)) {
            return Some(op);
        }

        paths
            .iter()
            .filter(|(template, _)| template.contains('{'))
            .find(|(template, _)| template_matches(template, &path))
            .and_then(|(_, item)| item.get(&method))
    }

    /// Declared JSON schema for a response status, if any
    pub fn response_schema(&self, method: &str, endpoint: &str, status: u16) -> Option<&Value> {
        self.find_operation(method, endpoint)?
            .get("responses")?
            .get(status.to_string())?
            .get("content")?
            .get("application/json")?
            .get("schema")
    }

    /// Check a response body. Undeclared operations and statuses pass.
    pub fn validate_response(
        &self,
        method: &str,
        endpoint: &str,
        status: u16,
        body: &Value,
    ) -> Result<()> {
        let violation = |detail: String| Error::ResponseSchemaViolation {
            method: method.to_uppercase(),
            path: endpoint.to_string(),
            status,
            detail,
        };

        let Some(schema) = self.response_schema(method, endpoint, status) else {
            trace!("No contract for {} {} ({})", method, endpoint, status);
            return Ok(());
        };

        let resolved = self.dereference(schema, &mut Vec::new()).map_err(violation)?;
        let compiled = JSONSchema::compile(&resolved)
            .map_err(|e| violation(format!("schema does not compile: {e}")))?;

        if let Err(errors) = compiled.validate(body) {
            let detail = errors
                .map(|e| {
                    let at = e.instance_path.to_string();
                    if at.is_empty() {
                        e.to_string()
                    } else {
                        format!("{at}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(violation(detail));
        }
        Ok(())
    }

    /// Inline every internal `$ref`, rejecting cycles
    fn dereference(&self, schema: &Value, stack: &mut Vec<String>) -> std::result::Result<Value, String> {
        match schema {
            Value::Object(map) => {
                if let Some(Value::String(reference)) = map.get("$ref") {
                    if stack.contains(reference) {
                        return Err(format!("cyclic schema reference {reference}"));
                    }
                    let target = self
                        .resolve_ref(reference)
                        .ok_or_else(|| format!("cannot resolve reference {reference}"))?;
                    stack.push(reference.clone());
                    let resolved = self.dereference(target, stack);
                    stack.pop();
                    return resolved;
                }

                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.dereference(value, stack)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.dereference(item, stack))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    fn resolve_ref(&self, reference: &str) -> Option<&Value> {
        let pointer = reference.strip_prefix('#')?;
        if !pointer.starts_with('/') {
            return None;
        }
        self.document.pointer(pointer)
    }
}

fn request_path(endpoint: &str) -> String {
    let path = match Url::parse(endpoint) {
        Ok(url) => url.path().to_string(),
        Err(_) => endpoint.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    }
}

fn template_matches(template: &str, path: &str) -> bool {
    let expected: Vec<&str> = template.trim_end_matches('/').split('/').collect();
    let actual: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    expected.len() == actual.len()
        && expected.iter().zip(&actual).all(|(e, a)| {
            if e.starts_with('{') && e.ends_with('}') {
                !a.is_empty()
            } else {
                e == a
            }
        })
}

/// YAML allows non-string keys (`200:`); JSON objects do not
fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(items.into_iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (yaml_key(k), yaml_to_json(v)))
                .collect(),
        ),
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

fn yaml_key(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => "null".to_string(),
        other => serde_yaml::to_string(&other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
