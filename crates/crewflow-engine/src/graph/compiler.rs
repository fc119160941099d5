use std::collections::{HashMap, HashSet};

use tracing::debug;

use crewflow_core::error::{CrewflowError, Result};

use super::config::NodeConfig;
use super::edge::Edge;
use super::node::Node;
use crate::definition::WorkflowDefinition;
use crate::executors::ExecutorRegistry;

/// A node paired with its validated, typed configuration.
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub node: Node,
    pub config: NodeConfig,
}

/// A validated DAG ready for scheduling.
///
/// Nodes are indexed in declaration order; edges are referenced by their
/// position in the definition.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    nodes: Vec<CompiledNode>,
    edges: Vec<Edge>,
    index: HashMap<String, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    layers: Vec<Vec<usize>>,
}

impl CompiledGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &CompiledNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn edge(&self, idx: usize) -> &Edge {
        &self.edges[idx]
    }

    /// Outgoing edge indices of a node, in definition order.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    /// Incoming edge indices of a node, in definition order.
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    pub fn is_root(&self, node: usize) -> bool {
        self.incoming[node].is_empty()
    }

    /// Structural layers as node indices.
    pub fn layers(&self) -> &[Vec<usize>] {
        &self.layers
    }

    /// Structural layers as node ids.
    pub fn layer_ids(&self) -> Vec<Vec<String>> {
        self.layers
            .iter()
            .map(|layer| layer.iter().map(|&i| self.nodes[i].node.id.clone()).collect())
            .collect()
    }

    /// Successor ids per node.
    pub fn adjacency(&self) -> HashMap<String, Vec<String>> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let targets = self.outgoing[i]
                    .iter()
                    .map(|&e| self.edges[e].target.clone())
                    .collect();
                (n.node.id.clone(), targets)
            })
            .collect()
    }

    /// Number of incoming edges per node.
    pub fn in_degree(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node.id.clone(), self.incoming[i].len()))
            .collect()
    }
}

/// Validate a definition and build its execution plan. Pure; no side effects.
pub fn compile(def: &WorkflowDefinition, registry: &ExecutorRegistry) -> Result<CompiledGraph> {
    if def.nodes.is_empty() {
        return Err(CrewflowError::InvalidDefinition(
            "workflow has no nodes".into(),
        ));
    }

    let mut index = HashMap::with_capacity(def.nodes.len());
    for (i, node) in def.nodes.iter().enumerate() {
        if index.insert(node.id.clone(), i).is_some() {
            return Err(CrewflowError::DuplicateNode(node.id.clone()));
        }
    }

    let mut nodes = Vec::with_capacity(def.nodes.len());
    for node in &def.nodes {
        let config = NodeConfig::parse(node.kind, &node.config)
            .map_err(|e| CrewflowError::invalid_config(&node.id, e.to_string()))?;
        let executor = registry.get(node.kind).ok_or_else(|| {
            CrewflowError::invalid_config(&node.id, format!("no executor for kind '{}'", node.kind))
        })?;
        executor.validate(&node.id, &config)?;
        nodes.push(CompiledNode {
            node: node.clone(),
            config,
        });
    }

    let mut outgoing = vec![Vec::new(); nodes.len()];
    let mut incoming = vec![Vec::new(); nodes.len()];
    for (e, edge) in def.edges.iter().enumerate() {
        let unknown = |id: &str| CrewflowError::UnknownNode {
            edge: edge.id.clone(),
            node: id.to_string(),
        };
        let src = *index.get(&edge.source).ok_or_else(|| unknown(&edge.source))?;
        let dst = *index.get(&edge.target).ok_or_else(|| unknown(&edge.target))?;
        if src == dst {
            return Err(CrewflowError::SelfLoop {
                edge: edge.id.clone(),
                node: edge.source.clone(),
            });
        }
        outgoing[src].push(e);
        incoming[dst].push(e);
    }

    for compiled in &nodes {
        if let NodeConfig::Aggregator(ref agg) = compiled.config {
            if let Some(missing) = agg.sources.iter().find(|s| !index.contains_key(s.as_str())) {
                return Err(CrewflowError::invalid_config(
                    &compiled.node.id,
                    format!("source '{}' is not a node in this workflow", missing),
                ));
            }
        }
    }

    let layers = kahn_layers(&nodes, &def.edges, &outgoing, &incoming)?;

    for (i, compiled) in nodes.iter().enumerate() {
        if let NodeConfig::Aggregator(ref agg) = compiled.config {
            let upstream = ancestors(i, &index, &def.edges, &incoming);
            let detached = agg
                .sources
                .iter()
                .find(|s| !upstream.contains(&index[s.as_str()]));
            if let Some(detached) = detached {
                return Err(CrewflowError::invalid_config(
                    &compiled.node.id,
                    format!("source '{}' is not upstream of this node", detached),
                ));
            }
        }
    }

    debug!(
        nodes = nodes.len(),
        edges = def.edges.len(),
        layers = layers.len(),
        "Workflow compiled"
    );

    Ok(CompiledGraph {
        nodes,
        edges: def.edges.clone(),
        index,
        outgoing,
        incoming,
        layers,
    })
}

/// Every node with a path into `node`.
fn ancestors(
    node: usize,
    index: &HashMap<String, usize>,
    edges: &[Edge],
    incoming: &[Vec<usize>],
) -> HashSet<usize> {
    let mut seen = HashSet::new();
    let mut queue = std::collections::VecDeque::from([node]);
    while let Some(n) = queue.pop_front() {
        for &e in &incoming[n] {
            let src = index[edges[e].source.as_str()];
            if seen.insert(src) {
                queue.push_back(src);
            }
        }
    }
    seen
}

/// Breadth-first Kahn pass. Each layer keeps declaration order.
fn kahn_layers(
    nodes: &[CompiledNode],
    edges: &[Edge],
    outgoing: &[Vec<usize>],
    incoming: &[Vec<usize>],
) -> Result<Vec<Vec<usize>>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.node.id.as_str(), i))
        .collect();
    let mut degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut layers = Vec::new();
    let mut current: Vec<usize> = (0..nodes.len()).filter(|&i| degree[i] == 0).collect();
    let mut consumed = HashSet::new();

    while !current.is_empty() {
        let mut next = Vec::new();
        for &n in &current {
            consumed.insert(n);
            for &e in &outgoing[n] {
                let t = index[edges[e].target.as_str()];
                degree[t] -= 1;
                if degree[t] == 0 {
                    next.push(t);
                }
            }
        }
        next.sort_unstable();
        layers.push(std::mem::replace(&mut current, next));
    }

    if consumed.len() < nodes.len() {
        let stuck = (0..nodes.len())
            .filter(|i| !consumed.contains(i))
            .map(|i| nodes[i].node.id.clone())
            .collect();
        return Err(CrewflowError::CycleDetected { nodes: stuck });
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_test_utils::WorkflowJson;
    use serde_json::json;

    fn compile_json(wf: serde_json::Value) -> Result<CompiledGraph> {
        let def = WorkflowDefinition::from_value(wf)?;
        compile(&def, &ExecutorRegistry::builtin())
    }

    fn diamond() -> serde_json::Value {
        WorkflowJson::new()
            .node("start", "trigger", json!({}))
            .node("left", "output", json!({}))
            .node("right", "output", json!({}))
            .node("join", "aggregator", json!({"sources": ["left", "right"]}))
            .edge("start", "left")
            .edge("start", "right")
            .edge("left", "join")
            .edge("right", "join")
            .build()
    }

    #[test]
    fn test_layers_of_diamond() {
        let graph = compile_json(diamond()).unwrap();
        assert_eq!(
            graph.layer_ids(),
            vec![vec!["start"], vec!["left", "right"], vec!["join"]]
        );
        assert_eq!(graph.in_degree()["join"], 2);
        assert_eq!(graph.adjacency()["start"], vec!["left", "right"]);
    }

    #[test]
    fn test_every_node_in_exactly_one_layer_after_predecessors() {
        let wf = WorkflowJson::new()
            .node("e", "output", json!({}))
            .node("a", "trigger", json!({}))
            .node("d", "output", json!({}))
            .node("b", "trigger", json!({}))
            .node("c", "output", json!({}))
            .edge("a", "c")
            .edge("b", "c")
            .edge("c", "d")
            .edge("a", "d")
            .edge("d", "e")
            .build();
        let graph = compile_json(wf).unwrap();

        let mut layer_of = HashMap::new();
        for (l, layer) in graph.layers().iter().enumerate() {
            for &n in layer {
                assert!(layer_of.insert(n, l).is_none(), "node in two layers");
            }
        }
        assert_eq!(layer_of.len(), graph.len());
        for n in 0..graph.len() {
            for &e in graph.incoming(n) {
                let src = graph.index_of(&graph.edge(e).source).unwrap();
                assert!(layer_of[&src] < layer_of[&n]);
            }
        }
        // declaration order inside a layer
        assert_eq!(graph.layer_ids()[0], vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_lists_stuck_nodes() {
        let wf = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .node("b", "output", json!({}))
            .node("c", "output", json!({}))
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "b")
            .build();
        match compile_json(wf).unwrap_err() {
            CrewflowError::CycleDetected { nodes } => assert_eq!(nodes, vec!["b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_structural_errors() {
        let dup = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .node("a", "output", json!({}))
            .build();
        assert!(matches!(compile_json(dup).unwrap_err(), CrewflowError::DuplicateNode(id) if id == "a"));

        let unknown = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .edge("a", "ghost")
            .build();
        assert!(matches!(
            compile_json(unknown).unwrap_err(),
            CrewflowError::UnknownNode { node, .. } if node == "ghost"
        ));

        let self_loop = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .edge("a", "a")
            .build();
        assert!(matches!(compile_json(self_loop).unwrap_err(), CrewflowError::SelfLoop { .. }));

        let bad_config = WorkflowJson::new()
            .node("p", "process", json!({"prompt": ""}))
            .build();
        assert!(matches!(
            compile_json(bad_config).unwrap_err(),
            CrewflowError::InvalidNodeConfig { node, .. } if node == "p"
        ));

        let missing_field = WorkflowJson::new()
            .node("r", "retrieval", json!({"topK": 3}))
            .build();
        assert!(matches!(
            compile_json(missing_field).unwrap_err(),
            CrewflowError::InvalidNodeConfig { .. }
        ));
    }

    #[test]
    fn test_aggregator_source_must_exist() {
        let wf = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .node("agg", "aggregator", json!({"sources": ["a", "b"]}))
            .edge("a", "agg")
            .build();
        let err = compile_json(wf).unwrap_err();
        assert!(err.to_string().contains("source 'b'"));
    }

    #[test]
    fn test_aggregator_source_must_be_upstream() {
        let wf = WorkflowJson::new()
            .node("start", "trigger", json!({}))
            .node("mid", "output", json!({}))
            .node("agg", "aggregator", json!({"sources": ["mid"]}))
            .edge("start", "mid")
            .edge("start", "agg")
            .build();
        let err = compile_json(wf).unwrap_err();
        assert!(matches!(err, CrewflowError::InvalidNodeConfig { ref node, .. } if node == "agg"));
        assert!(err.to_string().contains("source 'mid' is not upstream"));
    }

    #[test]
    fn test_aggregator_accepts_transitive_sources() {
        let wf = WorkflowJson::new()
            .node("start", "trigger", json!({}))
            .node("fetch", "output", json!({}))
            .node("shape", "output", json!({}))
            .node("agg", "aggregator", json!({"sources": ["start", "fetch"]}))
            .edge("start", "fetch")
            .edge("fetch", "shape")
            .edge("shape", "agg")
            .build();
        let graph = compile_json(wf).unwrap();
        assert_eq!(graph.layer_ids().last().unwrap(), &vec!["agg"]);
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = compile_json(json!({"nodes": [], "edges": []})).unwrap_err();
        assert!(matches!(err, CrewflowError::InvalidDefinition(_)));
    }
}
