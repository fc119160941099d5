use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrewflowError {
    // Structural errors (raised before a run starts)
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge {edge} references unknown node: {node}")]
    UnknownNode { edge: String, node: String },

    #[error("Edge {edge} loops back onto node {node}")]
    SelfLoop { edge: String, node: String },

    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Invalid config for node {node}: {message}")]
    InvalidNodeConfig { node: String, message: String },

    // Node execution errors
    #[error("Node {node} failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Script timed out after {timeout_ms}ms")]
    ScriptTimeout { timeout_ms: u64 },

    #[error("Script error: {0}")]
    Script(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model response parse error: {0}")]
    ModelParse(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Delegation to agent {agent} failed: {message}")]
    Delegate { agent: String, message: String },

    // Run errors
    #[error("run aborted")]
    RunAborted,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrewflowError {
    /// Whether this error describes a malformed graph rather than a runtime failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidDefinition(_)
                | Self::DuplicateNode(_)
                | Self::UnknownNode { .. }
                | Self::SelfLoop { .. }
                | Self::CycleDetected { .. }
                | Self::InvalidNodeConfig { .. }
        )
    }

    /// Whether a node that raised this error may be invoked again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::HttpRequest(_)
            | Self::Script(_)
            | Self::ScriptTimeout { .. }
            | Self::ModelRequest(_) => true,
            _ => false,
        }
    }

    pub fn invalid_config(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidNodeConfig {
            node: node.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CrewflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_classification() {
        assert!(CrewflowError::DuplicateNode("a".into()).is_structural());
        assert!(CrewflowError::CycleDetected {
            nodes: vec!["a".into(), "b".into()]
        }
        .is_structural());
        assert!(!CrewflowError::RunAborted.is_structural());
        assert!(!CrewflowError::ScriptTimeout { timeout_ms: 10 }.is_structural());
    }

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = CrewflowError::CycleDetected {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected among nodes: a, b");
    }

    #[test]
    fn test_retryable_http_status() {
        assert!(CrewflowError::HttpStatus { status: 503, body: String::new() }.is_retryable());
        assert!(CrewflowError::HttpStatus { status: 429, body: String::new() }.is_retryable());
        assert!(!CrewflowError::HttpStatus { status: 404, body: String::new() }.is_retryable());
    }
}
