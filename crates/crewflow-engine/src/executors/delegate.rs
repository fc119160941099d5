use futures::future::BoxFuture;
use serde_json::Value;
use tracing::info;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::NodeKind;

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;

/// Forwards a message to another agent and returns its reply.
pub struct DelegateExecutor;

impl StepExecutor for DelegateExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Delegate
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Delegate(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Delegate));
            };
            let delegate = ctx.services.delegate.as_ref().ok_or_else(|| CrewflowError::Delegate {
                agent: config.agent_id.clone(),
                message: "no agent delegate configured".into(),
            })?;
            let message = config.message.clone().unwrap_or_else(|| input.upstream_text());

            info!(node_id = %input.node_id, agent_id = %config.agent_id, "Delegating to agent");
            let reply = delegate.ask(&ctx.tenant_id, &config.agent_id, message).await?;
            Ok(Value::String(reply))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::test_support::{context, services};
    use crate::pool::VariablePool;
    use crewflow_test_utils::{EchoDelegate, MockModelClient};
    use serde_json::json;
    use std::sync::Arc;

    fn input<'a>(pool: &'a VariablePool, raw: Value) -> StepInput<'a> {
        StepInput {
            node_id: "ask_legal",
            config: NodeConfig::parse(NodeKind::Delegate, &raw).unwrap(),
            upstream: json!("Is this contract OK?"),
            pool,
        }
    }

    #[tokio::test]
    async fn test_reply_is_output() {
        let ctx = context(
            "",
            services(MockModelClient::new()).with_delegate(Arc::new(EchoDelegate)),
        );
        let pool = VariablePool::new();
        let out = DelegateExecutor
            .execute(input(&pool, json!({"agentId": "legal"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out, json!("legal: Is this contract OK?"));
    }

    #[tokio::test]
    async fn test_missing_delegate() {
        let ctx = context("", services(MockModelClient::new()));
        let pool = VariablePool::new();
        let err = DelegateExecutor
            .execute(input(&pool, json!({"agentId": "legal", "message": "hi"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CrewflowError::Delegate { ref agent, .. } if agent == "legal"));
    }
}
