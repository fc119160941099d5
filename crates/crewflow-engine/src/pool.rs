use std::collections::HashMap;

use serde_json::Value;

use crewflow_core::error::{CrewflowError, Result};

/// Completed node outputs for one run, keyed by node id. Write-once per id.
#[derive(Debug, Default, Clone)]
pub struct VariablePool {
    values: HashMap<String, Value>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's output. A second write for the same id is rejected.
    pub fn insert(&mut self, node_id: &str, value: Value) -> Result<()> {
        if self.values.contains_key(node_id) {
            return Err(CrewflowError::NodeExecution {
                node: node_id.to_string(),
                message: "output already recorded for this run".into(),
            });
        }
        self.values.insert(node_id.to_string(), value);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&Value> {
        self.values.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.values.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
