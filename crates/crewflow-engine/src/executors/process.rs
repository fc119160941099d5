use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::{ChatMessage, CompletionRequest, NodeKind};

use super::{strip_code_fence, StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::config::OutputSchema;
use crate::graph::NodeConfig;

/// Sends a prompt to the model client.
pub struct ProcessExecutor;

impl StepExecutor for ProcessExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Process
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Process(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Process));
            };
            let model = ctx.defaults.model.with_override(config.model.as_ref());

            let mut system = config.system_prompt.clone().unwrap_or_default();
            if let Some(ref schema) = config.output_schema {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&schema_instruction(schema));
            }

            let mut messages = Vec::new();
            if !system.is_empty() {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(config.prompt.clone()));

            let mut request = CompletionRequest::new(messages);
            if config.output_schema.is_some() {
                request = request.json();
            }

            let completion = ctx.services.model.complete(&model, request).await?;
            debug!(
                node_id = %input.node_id,
                model = %model.model_id,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                "Model step completed"
            );

            match config.output_schema {
                Some(ref schema) => parse_structured(&completion.text, schema),
                None => Ok(Value::String(completion.text)),
            }
        })
    }
}

fn schema_instruction(schema: &OutputSchema) -> String {
    let mut out = String::from("Respond with a single JSON object.");
    if !schema.properties.is_empty() {
        let fields: Vec<String> = schema
            .properties
            .iter()
            .map(|(name, prop)| format!("\"{}\" ({})", name, prop.kind))
            .collect();
        out.push_str(&format!(" Fields: {}.", fields.join(", ")));
    }
    if !schema.required.is_empty() {
        out.push_str(&format!(" Required: {}.", schema.required.join(", ")));
    }
    out
}

/// Parse a model reply as a JSON object and check it against the schema.
pub(crate) fn parse_structured(text: &str, schema: &OutputSchema) -> Result<Value> {
    let value: Value = serde_json::from_str(strip_code_fence(text))
        .map_err(|e| CrewflowError::ModelParse(format!("response is not valid JSON: {}", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| CrewflowError::ModelParse("expected a JSON object".into()))?;

    let mut issues = Vec::new();
    for key in &schema.required {
        if !obj.contains_key(key) {
            issues.push(format!("missing required key '{}'", key));
        }
    }
    for (name, prop) in &schema.properties {
        if let Some(v) = obj.get(name) {
            if !matches_type(v, &prop.kind) {
                issues.push(format!("'{}' should be {}", name, prop.kind));
            }
        }
    }

    if issues.is_empty() {
        Ok(value)
    } else {
        Err(CrewflowError::ModelParse(issues.join("; ")))
    }
}

fn matches_type(value: &Value, kind: &str) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}
