use serde::{Deserialize, Serialize};
use serde_json::Value;

use crewflow_core::types::NodeKind;

/// What happens to the run when a node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Finish the current layer, then stop the run.
    #[default]
    Fail,
    /// Record the failure and hand `default_output` to dependents.
    Continue,
}

/// A step in a workflow graph.
///
/// `config` is kept as raw JSON here; the compiler turns it into a typed
/// [`NodeConfig`](super::config::NodeConfig) and rejects it if invalid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable label. Defaults to the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Step kind.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Kind-specific configuration; string values may contain placeholders.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub error_handling: ErrorPolicy,
    /// Output given to dependents when a `continue` node fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output: Option<Value>,
}

impl Node {
    /// Create a node with an empty config.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: None,
            kind,
            config: Value::Object(Default::default()),
            error_handling: ErrorPolicy::Fail,
            default_output: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Keep the run going if this node fails, passing `default_output` on.
    pub fn continue_on_error(mut self, default_output: Option<Value>) -> Self {
        self.error_handling = ErrorPolicy::Continue;
        self.default_output = default_output;
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Value written to the pool when this node fails under `continue`.
    pub fn fallback_output(&self) -> Value {
        self.default_output
            .clone()
            .unwrap_or_else(|| Value::String(String::new()))
    }
}
