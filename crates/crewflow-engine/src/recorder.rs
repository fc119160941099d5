use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crewflow_core::types::{NodeKind, NodeStatus, RunId};

/// The sealed record of one node within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub node_id: String,
    pub kind: NodeKind,
    pub label: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Invocations made, including retries. Zero for skipped nodes.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Summary returned to the caller once a run is sealed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionResult {
    pub run_id: String,
    pub success: bool,
    pub final_output: Value,
    /// One entry per node, in scheduling order. Nodes in layers the run
    /// never reached (fail-fast abort or cancellation) are `Pending`.
    pub node_results: Vec<NodeExecutionResult>,
    pub total_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecutionResult {
    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionResult> {
        self.node_results.iter().find(|r| r.node_id == node_id)
    }
}

/// Accumulates node results for a run and seals the summary.
pub struct RunRecorder {
    run_id: RunId,
    started: Instant,
    results: Vec<NodeExecutionResult>,
    error: Option<String>,
}

impl RunRecorder {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            results: Vec::new(),
            error: None,
        }
    }

    pub fn record(&mut self, result: NodeExecutionResult) {
        self.results.push(result);
    }

    /// Mark the run failed. The first reason wins.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }

    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn results(&self) -> &[NodeExecutionResult] {
        &self.results
    }

    /// Seal the run. The final output comes from the last completed output
    /// node, falling back to the last completed node of any kind.
    pub fn seal(self) -> WorkflowExecutionResult {
        let completed = || self.results.iter().rev().filter(|r| r.status == NodeStatus::Completed);
        let final_output = completed()
            .find(|r| r.kind == NodeKind::Output)
            .or_else(|| completed().next())
            .map(|r| r.output.clone())
            .unwrap_or(Value::Null);

        WorkflowExecutionResult {
            run_id: self.run_id.0,
            success: self.error.is_none(),
            final_output,
            node_results: self.results,
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            error: self.error,
        }
    }
}
