//! `{{nodeId.path}}` placeholder resolution.
//!
//! Identifiers are node ids, `input` (the raw run input; `input.x` reads
//! fields when the input is a JSON object) or `upstream` (the value the
//! node receives along its incoming edges). Path segments index objects by
//! key and arrays by position. Anything missing resolves to `""`.
//!
//! A string that is exactly one placeholder resolves to the referenced
//! value itself; mixed strings interpolate display strings.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crewflow_core::error::Result;

use super::config::NodeConfig;
use crate::pool::VariablePool;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_$-]+(?:\.[A-Za-z0-9_$-]+)*)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

pub fn has_placeholders(s: &str) -> bool {
    placeholder().is_match(s)
}

/// Display form used when a value is interpolated into text.
pub fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What placeholders resolve against.
pub struct Scope<'a> {
    pub pool: &'a VariablePool,
    pub input: &'a str,
    pub upstream: &'a Value,
}

impl<'a> Scope<'a> {
    pub fn new(pool: &'a VariablePool, input: &'a str, upstream: &'a Value) -> Self {
        Self {
            pool,
            input,
            upstream,
        }
    }

    fn lookup(&self, reference: &str) -> Option<Value> {
        let mut segments = reference.split('.');
        let root = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let base = match root {
            "input" if rest.is_empty() => return Some(Value::String(self.input.to_string())),
            "input" => serde_json::from_str::<Value>(self.input).ok()?,
            "upstream" => self.upstream.clone(),
            id => self.pool.get(id)?.clone(),
        };
        walk(&base, &rest).cloned()
    }
}

fn walk<'v>(value: &'v Value, path: &[&str]) -> Option<&'v Value> {
    let mut current = value;
    for seg in path {
        current = match current {
            Value::Object(map) => map.get(*seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve placeholders in a single string.
pub fn resolve_str(s: &str, scope: &Scope<'_>) -> Value {
    let re = placeholder();
    if let Some(caps) = re.captures(s) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == s.len() {
                return scope
                    .lookup(&caps[1])
                    .unwrap_or_else(|| Value::String(String::new()));
            }
        }
    } else {
        return Value::String(s.to_string());
    }

    let out = re.replace_all(s, |caps: &Captures<'_>| {
        scope.lookup(&caps[1]).map(|v| display(&v)).unwrap_or_default()
    });
    Value::String(out.into_owned())
}

/// Resolve every string inside a JSON tree.
pub fn resolve_value(value: &Value, scope: &Scope<'_>) -> Value {
    match value {
        Value::String(s) => resolve_str(s, scope),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a node's typed config. Script source is left untouched.
pub fn resolve_config(config: &NodeConfig, scope: &Scope<'_>) -> Result<NodeConfig> {
    let kind = config.kind();
    let raw = config.to_value()?;
    let resolved = match (config, raw) {
        (NodeConfig::Script(script), Value::Object(mut map)) => {
            map.remove("code");
            let mut out = match resolve_value(&Value::Object(map), scope) {
                Value::Object(m) => m,
                _ => Default::default(),
            };
            out.insert("code".into(), Value::String(script.code.clone()));
            Value::Object(out)
        }
        (_, raw) => resolve_value(&raw, scope),
    };
    Ok(NodeConfig::parse(kind, &resolved)?)
}
