use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{json, Value};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::NodeKind;

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::config::{LogicalOperator, Operator, Predicate};
use crate::graph::template::display;
use crate::graph::NodeConfig;

/// Evaluates predicates and emits `{result, selector}`.
pub struct ConditionExecutor;

impl StepExecutor for ConditionExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Condition
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        _ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Condition(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Condition));
            };

            let mut outcomes = Vec::with_capacity(config.conditions.len());
            for predicate in &config.conditions {
                let left = predicate.left.as_ref().unwrap_or(&input.upstream);
                outcomes.push(evaluate(predicate, left).map_err(|message| {
                    CrewflowError::NodeExecution {
                        node: input.node_id.to_string(),
                        message,
                    }
                })?);
            }

            let result = match config.logical_operator {
                LogicalOperator::And => outcomes.iter().all(|b| *b),
                LogicalOperator::Or => outcomes.iter().any(|b| *b),
            };
            Ok(json!({ "result": result, "selector": result.to_string() }))
        })
    }
}

/// Evaluate one predicate. Errors only on an invalid `matches` pattern.
pub fn evaluate(predicate: &Predicate, left: &Value) -> std::result::Result<bool, String> {
    let right = &predicate.right;
    Ok(match predicate.operator {
        Operator::Equals => loosely_equal(left, right),
        Operator::NotEquals => !loosely_equal(left, right),
        Operator::Contains => contains(left, right),
        Operator::NotContains => !contains(left, right),
        Operator::StartsWith => display(left).starts_with(&display(right)),
        Operator::EndsWith => display(left).ends_with(&display(right)),
        Operator::IsEmpty => is_empty(left),
        Operator::IsNotEmpty => !is_empty(left),
        Operator::GreaterThan => compare(left, right, |a, b| a > b),
        Operator::LessThan => compare(left, right, |a, b| a < b),
        Operator::GreaterOrEqual => compare(left, right, |a, b| a >= b),
        Operator::LessOrEqual => compare(left, right, |a, b| a <= b),
        Operator::In => member_of(left, right),
        Operator::NotIn => !member_of(left, right),
        Operator::Matches => {
            let re = Regex::new(&display(right)).map_err(|e| format!("invalid pattern: {}", e))?;
            re.is_match(&display(left))
        }
    })
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => display(a) == display(b),
    }
}

fn compare(a: &Value, b: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => op(x, y),
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => map.contains_key(&display(needle)),
        other => display(other).contains(&display(needle)),
    }
}

fn member_of(item: &Value, set: &Value) -> bool {
    match set {
        Value::Array(items) => items.iter().any(|candidate| loosely_equal(item, candidate)),
        Value::String(s) => s.split(',').any(|part| part.trim() == display(item)),
        _ => false,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
