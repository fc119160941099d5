use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crewflow_core::error::Result;
use crewflow_core::types::NodeKind;

use super::{RetryPolicy, StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;
use crate::sandbox::ScriptRequest;

/// Runs a user-authored `main` function in the script sandbox.
pub struct ScriptExecutor;

impl StepExecutor for ScriptExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Script
    }

    fn retry_policy(&self, config: &NodeConfig) -> RetryPolicy {
        match config {
            NodeConfig::Script(c) => RetryPolicy {
                max_retries: c.retry_count,
                interval: Duration::from_millis(c.retry_interval),
                retryable_only: false,
            },
            _ => RetryPolicy::default(),
        }
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Script(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Script));
            };

            let mut args = serde_json::Map::new();
            for var in &config.variables {
                args.insert(var.name.clone(), var.value.clone());
            }
            args.insert("input".into(), input.upstream.clone());

            let timeout = config
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(ctx.services.script_timeout);

            ctx.services
                .scripts
                .run(ScriptRequest {
                    code: config.code.clone(),
                    args,
                    timeout,
                })
                .await
        })
    }
}
