use std::path::Path;

use serde::{Deserialize, Serialize};

use crewflow_core::error::{CrewflowError, Result};

use crate::graph::{Edge, Node};

/// A declarative workflow: nodes plus the edges between them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Parse a definition from JSON text. Unknown node kinds are rejected here.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| CrewflowError::InvalidDefinition(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| CrewflowError::InvalidDefinition(e.to_string()))
    }

    /// Read and parse a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_core::types::NodeKind;

    #[test]
    fn test_from_json() {
        let def = WorkflowDefinition::from_json(
            r#"{
                "nodes": [
                    {"id": "start", "type": "trigger"},
                    {"id": "done", "type": "output", "label": "Done"}
                ],
                "edges": [{"id": "e1", "source": "start", "target": "done"}]
            }"#,
        )
        .unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[1].kind, NodeKind::Output);
        assert_eq!(def.edges[0].target, "done");
    }

    #[test]
    fn test_unknown_kind_is_invalid_definition() {
        let err = WorkflowDefinition::from_json(r#"{"nodes": [{"id": "a", "type": "warp"}]}"#)
            .unwrap_err();
        assert!(matches!(err, CrewflowError::InvalidDefinition(_)));
        assert!(err.is_structural());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        std::fs::write(&path, r#"{"nodes": [{"id": "a", "type": "start"}]}"#).unwrap();
        let def = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(def.nodes[0].kind, NodeKind::Trigger);
        assert!(def.edges.is_empty());
    }
}
