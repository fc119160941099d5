//! Typed per-kind node configuration.
//!
//! Text fields accept any JSON value after placeholder resolution and are
//! coerced to their display string, so `"{{node.count}}"` may land in a
//! prompt even though it resolves to a number.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crewflow_core::config::ModelOverride;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::NodeKind;

use super::template;

fn text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(template::display(&v))
}

fn opt_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Null => None,
        other => Some(template::display(&other)),
    })
}

fn default_method() -> String { "GET".to_string() }
fn default_top_k() -> usize { 5 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Parse the run input as JSON when it is valid JSON.
    #[serde(default)]
    pub parse_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    #[serde(deserialize_with = "text")]
    pub prompt: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<ModelOverride>,
    /// When set the model must answer with a matching JSON object.
    #[serde(default)]
    pub output_schema: Option<OutputSchema>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: String,
}

const SCHEMA_TYPES: &[&str] = &["string", "number", "integer", "boolean", "object", "array"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    /// JavaScript source defining `main`. Never template-resolved.
    pub code: String,
    #[serde(default)]
    pub variables: Vec<ScriptVariable>,
    /// Per-invocation timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptVariable {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpStepConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(deserialize_with = "text")]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Request timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_interval: u64,
    /// Name of a run credential sent as a bearer token.
    #[serde(default)]
    pub auth: Option<String>,
}

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    In,
    NotIn,
    Matches,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    /// Defaults to the upstream value.
    #[serde(default)]
    pub left: Option<Value>,
    pub operator: Operator,
    #[serde(default)]
    pub right: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    #[serde(default)]
    pub conditions: Vec<Predicate>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default, deserialize_with = "opt_text")]
    pub query: Option<String>,
    pub categories: Vec<Category>,
    #[serde(default)]
    pub fallback_category: Option<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: Option<ModelOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateMode {
    #[default]
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorConfig {
    pub sources: Vec<String>,
    #[serde(default)]
    pub mode: AggregateMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTarget {
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "opt_text")]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    #[serde(default, deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub message: Option<String>,
    #[serde(default)]
    pub site: bool,
    #[serde(default)]
    pub email: Option<EmailTarget>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalConfig {
    pub knowledge_base_id: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub query: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConfig {
    pub agent_id: String,
    #[serde(default, deserialize_with = "opt_text")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Defaults to the upstream value.
    #[serde(default)]
    pub value: Option<Value>,
}

/// Typed configuration, one variant per step kind.
#[derive(Debug, Clone)]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Process(ProcessConfig),
    Script(ScriptConfig),
    Http(HttpStepConfig),
    Condition(ConditionConfig),
    Classifier(ClassifierConfig),
    Aggregator(AggregatorConfig),
    Notification(NotificationConfig),
    Retrieval(RetrievalConfig),
    Delegate(DelegateConfig),
    Output(OutputConfig),
}

impl NodeConfig {
    /// Parse raw JSON config for the given kind. A missing config is `{}`.
    pub fn parse(kind: NodeKind, raw: &Value) -> std::result::Result<Self, serde_json::Error> {
        let raw = match raw {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        Ok(match kind {
            NodeKind::Trigger => Self::Trigger(serde_json::from_value(raw)?),
            NodeKind::Process => Self::Process(serde_json::from_value(raw)?),
            NodeKind::Script => Self::Script(serde_json::from_value(raw)?),
            NodeKind::Http => Self::Http(serde_json::from_value(raw)?),
            NodeKind::Condition => Self::Condition(serde_json::from_value(raw)?),
            NodeKind::Classifier => Self::Classifier(serde_json::from_value(raw)?),
            NodeKind::Aggregator => Self::Aggregator(serde_json::from_value(raw)?),
            NodeKind::Notification => Self::Notification(serde_json::from_value(raw)?),
            NodeKind::Retrieval => Self::Retrieval(serde_json::from_value(raw)?),
            NodeKind::Delegate => Self::Delegate(serde_json::from_value(raw)?),
            NodeKind::Output => Self::Output(serde_json::from_value(raw)?),
        })
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Trigger(_) => NodeKind::Trigger,
            Self::Process(_) => NodeKind::Process,
            Self::Script(_) => NodeKind::Script,
            Self::Http(_) => NodeKind::Http,
            Self::Condition(_) => NodeKind::Condition,
            Self::Classifier(_) => NodeKind::Classifier,
            Self::Aggregator(_) => NodeKind::Aggregator,
            Self::Notification(_) => NodeKind::Notification,
            Self::Retrieval(_) => NodeKind::Retrieval,
            Self::Delegate(_) => NodeKind::Delegate,
            Self::Output(_) => NodeKind::Output,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let v = match self {
            Self::Trigger(c) => serde_json::to_value(c)?,
            Self::Process(c) => serde_json::to_value(c)?,
            Self::Script(c) => serde_json::to_value(c)?,
            Self::Http(c) => serde_json::to_value(c)?,
            Self::Condition(c) => serde_json::to_value(c)?,
            Self::Classifier(c) => serde_json::to_value(c)?,
            Self::Aggregator(c) => serde_json::to_value(c)?,
            Self::Notification(c) => serde_json::to_value(c)?,
            Self::Retrieval(c) => serde_json::to_value(c)?,
            Self::Delegate(c) => serde_json::to_value(c)?,
            Self::Output(c) => serde_json::to_value(c)?,
        };
        Ok(v)
    }
}

/// Shape checks that do not depend on the rest of the graph.
pub fn validate(node_id: &str, config: &NodeConfig) -> Result<()> {
    let bad = |msg: &str| Err(CrewflowError::invalid_config(node_id, msg));
    match config {
        NodeConfig::Trigger(_) | NodeConfig::Output(_) => Ok(()),
        NodeConfig::Process(c) => {
            if c.prompt.trim().is_empty() {
                return bad("prompt must not be empty");
            }
            if let Some(ref schema) = c.output_schema {
                for (name, prop) in &schema.properties {
                    if !SCHEMA_TYPES.contains(&prop.kind.as_str()) {
                        return bad(&format!("property '{}' has unknown type '{}'", name, prop.kind));
                    }
                }
            }
            Ok(())
        }
        NodeConfig::Script(c) => {
            if c.code.trim().is_empty() {
                return bad("code must not be empty");
            }
            if c.timeout == Some(0) {
                return bad("timeout must be positive");
            }
            let mut seen = HashSet::new();
            for var in &c.variables {
                if !is_identifier(&var.name) || var.name == "input" {
                    return bad(&format!("invalid variable name '{}'", var.name));
                }
                if !seen.insert(var.name.as_str()) {
                    return bad(&format!("duplicate variable '{}'", var.name));
                }
            }
            Ok(())
        }
        NodeConfig::Http(c) => {
            if c.url.trim().is_empty() {
                return bad("url must not be empty");
            }
            if !HTTP_METHODS.contains(&c.method.to_ascii_uppercase().as_str()) {
                return bad(&format!("unsupported method '{}'", c.method));
            }
            if c.timeout == Some(0) {
                return bad("timeout must be positive");
            }
            Ok(())
        }
        NodeConfig::Condition(c) => {
            if c.conditions.is_empty() {
                return bad("at least one condition is required");
            }
            for p in &c.conditions {
                if p.operator != Operator::Matches {
                    continue;
                }
                match p.right.as_str() {
                    Some(pattern) if template::has_placeholders(pattern) => {}
                    Some(pattern) => {
                        if let Err(e) = regex::Regex::new(pattern) {
                            return bad(&format!("invalid pattern: {}", e));
                        }
                    }
                    None => return bad("matches requires a string pattern"),
                }
            }
            Ok(())
        }
        NodeConfig::Classifier(c) => {
            if c.categories.is_empty() {
                return bad("at least one category is required");
            }
            let mut keys = HashSet::new();
            for cat in &c.categories {
                if cat.key.trim().is_empty() {
                    return bad("category key must not be empty");
                }
                if !keys.insert(cat.key.as_str()) {
                    return bad(&format!("duplicate category '{}'", cat.key));
                }
            }
            if let Some(ref fallback) = c.fallback_category {
                if !keys.contains(fallback.as_str()) {
                    return bad(&format!("fallback category '{}' is not declared", fallback));
                }
            }
            Ok(())
        }
        NodeConfig::Aggregator(c) => {
            if c.sources.is_empty() {
                return bad("sources must not be empty");
            }
            Ok(())
        }
        NodeConfig::Notification(c) => {
            if !c.site && c.email.is_none() {
                return bad("enable site or email delivery");
            }
            if c.email.as_ref().is_some_and(|e| e.to.is_empty()) {
                return bad("email needs at least one recipient");
            }
            Ok(())
        }
        NodeConfig::Retrieval(c) => {
            if c.knowledge_base_id.trim().is_empty() {
                return bad("knowledgeBaseId must not be empty");
            }
            if c.top_k == 0 {
                return bad("topK must be positive");
            }
            Ok(())
        }
        NodeConfig::Delegate(c) => {
            if c.agent_id.trim().is_empty() {
                return bad("agentId must not be empty");
            }
            Ok(())
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(kind: NodeKind, raw: Value) -> NodeConfig {
        NodeConfig::parse(kind, &raw).unwrap()
    }

    #[test]
    fn test_missing_config_is_empty_object() {
        let cfg = NodeConfig::parse(NodeKind::Trigger, &Value::Null).unwrap();
        assert!(matches!(cfg, NodeConfig::Trigger(TriggerConfig { parse_json: false })));
    }

    #[test]
    fn test_text_fields_accept_non_strings() {
        let cfg = parse(NodeKind::Process, json!({"prompt": 42}));
        match cfg {
            NodeConfig::Process(c) => assert_eq!(c.prompt, "42"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_condition_operators_camel_case() {
        let cfg = parse(
            NodeKind::Condition,
            json!({"conditions": [{"operator": "greaterOrEqual", "right": 3}], "logicalOperator": "or"}),
        );
        match cfg {
            NodeConfig::Condition(c) => {
                assert_eq!(c.conditions[0].operator, Operator::GreaterOrEqual);
                assert_eq!(c.logical_operator, LogicalOperator::Or);
                assert!(c.conditions[0].left.is_none());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let cases = vec![
            (NodeKind::Process, json!({"prompt": "  "})),
            (NodeKind::Script, json!({"code": "function main(){}", "variables": [{"name": "1x"}]})),
            (NodeKind::Http, json!({"url": "http://x", "method": "BREW"})),
            (NodeKind::Condition, json!({"conditions": []})),
            (NodeKind::Condition, json!({"conditions": [{"operator": "matches", "right": "("}]})),
            (NodeKind::Classifier, json!({"categories": [{"key": "a"}], "fallbackCategory": "b"})),
            (NodeKind::Notification, json!({"title": "x"})),
            (NodeKind::Retrieval, json!({"knowledgeBaseId": "kb", "topK": 0})),
            (NodeKind::Delegate, json!({"agentId": ""})),
        ];
        for (kind, raw) in cases {
            let cfg = parse(kind, raw.clone());
            let err = validate("n", &cfg).unwrap_err();
            assert!(
                matches!(err, CrewflowError::InvalidNodeConfig { .. }),
                "{kind} {raw} => {err}"
            );
        }
    }

    #[test]
    fn test_templated_pattern_skips_regex_check() {
        let cfg = parse(
            NodeKind::Condition,
            json!({"conditions": [{"operator": "matches", "right": "{{rules.pattern}}"}]}),
        );
        assert!(validate("n", &cfg).is_ok());
    }

    #[test]
    fn test_round_trip_through_value() {
        let cfg = parse(
            NodeKind::Http,
            json!({"url": "https://api.example.com/{{input}}", "retryCount": 2}),
        );
        let back = NodeConfig::parse(NodeKind::Http, &cfg.to_value().unwrap()).unwrap();
        match back {
            NodeConfig::Http(c) => {
                assert_eq!(c.method, "GET");
                assert_eq!(c.retry_count, 2);
                assert_eq!(c.url, "https://api.example.com/{{input}}");
            }
            _ => unreachable!(),
        }
    }
}
