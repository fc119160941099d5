use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crewflow_core::error::Result;
use crewflow_core::types::NodeKind;

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::config::AggregateMode;
use crate::graph::NodeConfig;

/// Collects source outputs in declared order. Missing sources become `null`.
pub struct AggregatorExecutor;

impl StepExecutor for AggregatorExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Aggregator
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        _ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Aggregator(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Aggregator));
            };
            let value_of = |id: &str| input.pool.get(id).cloned().unwrap_or(Value::Null);

            Ok(match config.mode {
                AggregateMode::Array => {
                    Value::Array(config.sources.iter().map(|s| value_of(s)).collect())
                }
                AggregateMode::Object => {
                    let map: Map<String, Value> = config
                        .sources
                        .iter()
                        .map(|s| (s.clone(), value_of(s)))
                        .collect();
                    Value::Object(map)
                }
            })
        })
    }
}
