use serde::{Deserialize, Serialize};

/// A directed connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Branch this edge belongs to. Untagged edges are unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_tag: Option<String>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            branch_tag: None,
        }
    }

    /// Create an edge taken only when the source selects `tag`.
    pub fn branch(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            branch_tag: Some(tag.into()),
            ..Self::new(id, source, target)
        }
    }

    /// The trimmed branch tag, if any. Blank tags count as untagged.
    pub fn tag(&self) -> Option<&str> {
        self.branch_tag
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::new("e1", "a", "b");
        assert_eq!(e.source, "a");
        assert_eq!(e.target, "b");
        assert!(e.tag().is_none());

        let e = Edge::branch("e2", "cond", "yes", " true ");
        assert_eq!(e.tag(), Some("true"));
    }

    #[test]
    fn test_blank_tag_is_untagged() {
        let e = Edge::branch("e1", "a", "b", "   ");
        assert!(e.tag().is_none());
    }

    #[test]
    fn test_camel_case_json() {
        let e: Edge = serde_json::from_str(
            r#"{"id": "e1", "source": "a", "target": "b", "branchTag": "false"}"#,
        )
        .unwrap();
        assert_eq!(e.tag(), Some("false"));
        let back = serde_json::to_value(&e).unwrap();
        assert_eq!(back["branchTag"], "false");
    }
}
