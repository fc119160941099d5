use futures::future::BoxFuture;
use serde_json::Value;

use crewflow_core::error::Result;
use crewflow_core::types::NodeKind;

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;

/// Marks the run's final output: `value` when set, else the upstream value.
pub struct OutputExecutor;

impl StepExecutor for OutputExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Output
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        _ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Output(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Output));
            };
            Ok(config.value.clone().unwrap_or_else(|| input.upstream.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{context, services};
    use crate::graph::config::OutputConfig;
    use crate::pool::VariablePool;
    use crewflow_test_utils::MockModelClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_value_or_upstream() {
        let ctx = context("", services(MockModelClient::new()));
        let pool = VariablePool::new();
        for (value, expected) in [(None, json!("up")), (Some(json!({"done": true})), json!({"done": true}))] {
            let out = OutputExecutor
                .execute(
                    StepInput {
                        node_id: "end",
                        config: NodeConfig::Output(OutputConfig { value }),
                        upstream: json!("up"),
                        pool: &pool,
                    },
                    &ctx,
                )
                .await
                .unwrap();
            assert_eq!(out, expected);
        }
    }
}
