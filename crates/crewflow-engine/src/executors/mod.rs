//! Step executors, one per node kind.

pub mod aggregator;
pub mod classifier;
pub mod condition;
pub mod delegate;
pub mod http;
pub mod notification;
pub mod output;
pub mod process;
pub mod retrieval;
pub mod script;
pub mod trigger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::NodeKind;

use crate::context::RunContext;
use crate::graph::config::{self, NodeConfig};
use crate::graph::template;
use crate::pool::VariablePool;

/// Input handed to an executor for one invocation.
pub struct StepInput<'a> {
    pub node_id: &'a str,
    /// Config with placeholders already resolved.
    pub config: NodeConfig,
    /// Output of the single live predecessor, an object keyed by predecessor
    /// id when there are several, or the raw run input for roots.
    pub upstream: Value,
    pub pool: &'a VariablePool,
}

impl StepInput<'_> {
    /// Upstream value rendered as text.
    pub fn upstream_text(&self) -> String {
        template::display(&self.upstream)
    }

    pub fn mismatch(&self, expected: NodeKind) -> CrewflowError {
        CrewflowError::NodeExecution {
            node: self.node_id.to_string(),
            message: format!(
                "expected {} config, got {}",
                expected,
                self.config.kind()
            ),
        }
    }
}

/// How many extra invocations a failed step gets.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
    /// Only retry errors that report themselves as retryable.
    pub retryable_only: bool,
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32, err: &CrewflowError) -> bool {
        if attempt > self.max_retries || matches!(err, CrewflowError::RunAborted) {
            return false;
        }
        !self.retryable_only || err.is_retryable()
    }
}

/// One implementation per step kind.
pub trait StepExecutor: Send + Sync + 'static {
    fn kind(&self) -> NodeKind;

    /// Reject a config before any node runs.
    fn validate(&self, node_id: &str, config: &NodeConfig) -> Result<()> {
        config::validate(node_id, config)
    }

    fn retry_policy(&self, _config: &NodeConfig) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// Maps node kinds to their executors.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for its kind.
    pub fn register(&mut self, executor: impl StepExecutor) {
        self.executors.insert(executor.kind(), Arc::new(executor));
    }

    pub fn get(&self, kind: NodeKind) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&kind)
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        self.executors.keys().copied().collect()
    }

    /// A registry with every built-in executor.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(trigger::TriggerExecutor);
        registry.register(process::ProcessExecutor);
        registry.register(script::ScriptExecutor);
        registry.register(http::HttpExecutor);
        registry.register(condition::ConditionExecutor);
        registry.register(classifier::ClassifierExecutor);
        registry.register(aggregator::AggregatorExecutor);
        registry.register(notification::NotificationExecutor);
        registry.register(retrieval::RetrievalExecutor);
        registry.register(delegate::DelegateExecutor);
        registry.register(output::OutputExecutor);
        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Strip a surrounding markdown code fence, if any.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_kind() {
        let registry = ExecutorRegistry::builtin();
        for kind in [
            NodeKind::Trigger,
            NodeKind::Process,
            NodeKind::Script,
            NodeKind::Http,
            NodeKind::Condition,
            NodeKind::Classifier,
            NodeKind::Aggregator,
            NodeKind::Notification,
            NodeKind::Retrieval,
            NodeKind::Delegate,
            NodeKind::Output,
        ] {
            assert_eq!(registry.get(kind).map(|e| e.kind()), Some(kind));
        }
        assert_eq!(registry.kinds().len(), 11);
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            max_retries: 2,
            interval: Duration::ZERO,
            retryable_only: true,
        };
        let transient = CrewflowError::HttpStatus { status: 503, body: String::new() };
        let permanent = CrewflowError::HttpStatus { status: 404, body: String::new() };
        assert!(policy.should_retry(1, &transient));
        assert!(policy.should_retry(2, &transient));
        assert!(!policy.should_retry(3, &transient));
        assert!(!policy.should_retry(1, &permanent));
        assert!(!policy.should_retry(1, &CrewflowError::RunAborted));
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\nplain\n```"), "plain");
    }
}
