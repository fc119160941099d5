use futures::future::BoxFuture;
use serde_json::Value;

use crewflow_core::error::Result;
use crewflow_core::types::NodeKind;

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;

/// Passes the run input through, optionally parsed as JSON.
pub struct TriggerExecutor;

impl StepExecutor for TriggerExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Trigger
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Trigger(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Trigger));
            };
            if config.parse_json {
                if let Ok(parsed) = serde_json::from_str::<Value>(&ctx.input) {
                    return Ok(parsed);
                }
            }
            Ok(Value::String(ctx.input.clone()))
        })
    }
}
