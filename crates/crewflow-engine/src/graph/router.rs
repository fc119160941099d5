//! Branch routing: which outgoing edges of a sealed node are live.

use serde_json::Value;

use crewflow_core::types::NodeKind;

use super::compiler::CompiledGraph;

/// How a node ended, as far as its outgoing edges are concerned.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Completed(&'a Value),
    /// Failed under the `continue` policy.
    Recovered,
    Skipped,
}

/// Branch key chosen by a condition or classifier output.
pub fn selector(kind: NodeKind, output: &Value) -> Option<String> {
    match kind {
        NodeKind::Condition => output
            .get("result")
            .and_then(Value::as_bool)
            .map(|b| b.to_string()),
        NodeKind::Classifier => output
            .get("result")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string()),
        _ => None,
    }
}

/// Whether an edge leaving a node with this outcome is satisfied.
pub fn is_satisfied(kind: NodeKind, tag: Option<&str>, outcome: Outcome<'_>) -> bool {
    match outcome {
        Outcome::Skipped => false,
        Outcome::Recovered => tag.is_none(),
        Outcome::Completed(output) => {
            if !kind.is_branching() {
                return true;
            }
            match tag {
                None => true,
                Some(tag) => selector(kind, output).as_deref() == Some(tag),
            }
        }
    }
}

/// Per-run edge state: unresolved, satisfied or dead.
#[derive(Debug, Clone)]
pub struct Liveness {
    edges: Vec<Option<bool>>,
}

impl Liveness {
    pub fn new(graph: &CompiledGraph) -> Self {
        let count = (0..graph.len()).map(|n| graph.outgoing(n).len()).sum();
        Self {
            edges: vec![None; count],
        }
    }

    /// Resolve every outgoing edge of `node` exactly once.
    pub fn seal(&mut self, graph: &CompiledGraph, node: usize, outcome: Outcome<'_>) {
        let kind = graph.node(node).node.kind;
        for &e in graph.outgoing(node) {
            debug_assert!(self.edges[e].is_none(), "edge resolved twice");
            self.edges[e] = Some(is_satisfied(kind, graph.edge(e).tag(), outcome));
        }
    }

    /// Roots are always live; others need at least one satisfied incoming edge.
    pub fn is_live(&self, graph: &CompiledGraph, node: usize) -> bool {
        graph.is_root(node) || graph.incoming(node).iter().any(|&e| self.edges[e] == Some(true))
    }

    /// Distinct sources of satisfied incoming edges, in edge order.
    pub fn live_sources<'g>(&self, graph: &'g CompiledGraph, node: usize) -> Vec<&'g str> {
        let mut sources: Vec<&str> = Vec::new();
        for &e in graph.incoming(node) {
            if self.edges[e] != Some(true) {
                continue;
            }
            let src = graph.edge(e).source.as_str();
            if !sources.contains(&src) {
                sources.push(src);
            }
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowDefinition;
    use crate::executors::ExecutorRegistry;
    use crate::graph::compile;
    use crewflow_test_utils::WorkflowJson;
    use serde_json::json;

    #[test]
    fn test_condition_selector() {
        assert_eq!(selector(NodeKind::Condition, &json!({"result": true})).as_deref(), Some("true"));
        assert_eq!(selector(NodeKind::Condition, &json!({"result": false})).as_deref(), Some("false"));
        assert_eq!(selector(NodeKind::Classifier, &json!({"result": " billing "})).as_deref(), Some("billing"));
        assert!(selector(NodeKind::Script, &json!({"result": true})).is_none());
    }

    #[test]
    fn test_tags_ignored_for_plain_nodes() {
        let out = json!("anything");
        assert!(is_satisfied(NodeKind::Script, Some("true"), Outcome::Completed(&out)));
        assert!(is_satisfied(NodeKind::Script, None, Outcome::Completed(&out)));
    }

    #[test]
    fn test_branch_tags_match_selector() {
        let out = json!({"result": false});
        assert!(is_satisfied(NodeKind::Condition, Some("false"), Outcome::Completed(&out)));
        assert!(!is_satisfied(NodeKind::Condition, Some("true"), Outcome::Completed(&out)));
        assert!(!is_satisfied(NodeKind::Condition, Some("False"), Outcome::Completed(&out)));
        assert!(is_satisfied(NodeKind::Condition, None, Outcome::Completed(&out)));
    }

    #[test]
    fn test_recovered_keeps_untagged_only() {
        assert!(is_satisfied(NodeKind::Condition, None, Outcome::Recovered));
        assert!(!is_satisfied(NodeKind::Condition, Some("true"), Outcome::Recovered));
        assert!(!is_satisfied(NodeKind::Http, None, Outcome::Skipped));
    }

    #[test]
    fn test_liveness_cascade() {
        let wf = WorkflowJson::new()
            .node("start", "trigger", json!({}))
            .node("check", "condition", json!({"conditions": [{"operator": "isEmpty"}]}))
            .node("yes", "output", json!({}))
            .node("no", "output", json!({}))
            .node("after_no", "output", json!({}))
            .edge("start", "check")
            .branch("check", "yes", "true")
            .branch("check", "no", "false")
            .edge("no", "after_no")
            .build();
        let def = WorkflowDefinition::from_value(wf).unwrap();
        let graph = compile(&def, &ExecutorRegistry::builtin()).unwrap();
        let idx = |id: &str| graph.index_of(id).unwrap();

        let mut live = Liveness::new(&graph);
        assert!(live.is_live(&graph, idx("start")));
        live.seal(&graph, idx("start"), Outcome::Completed(&json!("")));
        live.seal(&graph, idx("check"), Outcome::Completed(&json!({"result": true})));

        assert!(live.is_live(&graph, idx("yes")));
        assert!(!live.is_live(&graph, idx("no")));
        live.seal(&graph, idx("no"), Outcome::Skipped);
        assert!(!live.is_live(&graph, idx("after_no")));
        assert_eq!(live.live_sources(&graph, idx("yes")), vec!["check"]);
    }
}
