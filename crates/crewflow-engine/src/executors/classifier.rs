use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crewflow_core::error::Result;
use crewflow_core::types::{ChatMessage, CompletionRequest, NodeKind};

use super::{strip_code_fence, StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::config::ClassifierConfig;
use crate::graph::NodeConfig;

const URGENCY_LEVELS: &[&str] = &["low", "medium", "high"];

/// Asks the model to pick one category; the key becomes the branch selector.
pub struct ClassifierExecutor;

impl StepExecutor for ClassifierExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Classifier
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Classifier(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Classifier));
            };
            let query = config.query.clone().unwrap_or_else(|| input.upstream_text());
            let model = ctx.defaults.model.with_override(config.model.as_ref());

            let request = CompletionRequest::new(vec![
                ChatMessage::system(system_prompt(config)),
                ChatMessage::user(query),
            ])
            .json();
            let completion = ctx.services.model.complete(&model, request).await?;

            let output = interpret(&completion.text, config);
            let category = output["result"].as_str().unwrap_or_default();
            debug!(node_id = %input.node_id, category, "Classified input");
            Ok(output)
        })
    }
}

fn system_prompt(config: &ClassifierConfig) -> String {
    let mut prompt = String::from(
        "Classify the user's message into exactly one of these categories:\n",
    );
    for cat in &config.categories {
        let name = if cat.name.is_empty() { &cat.key } else { &cat.name };
        prompt.push_str(&format!("- {}: {}", cat.key, name));
        if !cat.description.is_empty() {
            prompt.push_str(&format!(" ({})", cat.description));
        }
        prompt.push('\n');
    }
    if let Some(ref extra) = config.instructions {
        prompt.push('\n');
        prompt.push_str(extra);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nRespond with a JSON object: {\"result\": <category key>, \"summary\": <one sentence>, \
         \"keywords\": [<strings>], \"urgency\": \"low\" | \"medium\" | \"high\"}",
    );
    prompt
}

/// Turn the model reply into the node output, falling back when the
/// reply is unusable or names an unknown category.
fn interpret(text: &str, config: &ClassifierConfig) -> Value {
    let parsed: Value = serde_json::from_str(strip_code_fence(text)).unwrap_or_else(|e| {
        warn!(error = %e, "Classifier reply is not JSON, using fallback category");
        Value::Null
    });

    let chosen = parsed
        .get("result")
        .and_then(Value::as_str)
        .map(str::trim)
        .and_then(|key| config.categories.iter().find(|c| c.key == key));
    let category = match chosen {
        Some(c) => c,
        None => {
            let fallback = config
                .fallback_category
                .as_deref()
                .and_then(|key| config.categories.iter().find(|c| c.key == key));
            match fallback.or_else(|| config.categories.first()) {
                Some(c) => c,
                None => return json!({"result": "", "summary": "", "keywords": [], "urgency": "low"}),
            }
        }
    };

    let keywords: Vec<String> = parsed
        .get("keywords")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let urgency = parsed
        .get("urgency")
        .and_then(Value::as_str)
        .map(|u| u.trim().to_lowercase())
        .filter(|u| URGENCY_LEVELS.contains(&u.as_str()))
        .unwrap_or_else(|| "low".to_string());

    let label = if category.name.is_empty() {
        &category.key
    } else {
        &category.name
    };
    json!({
        "result": category.key,
        "category": label,
        "summary": parsed.get("summary").and_then(Value::as_str).unwrap_or_default(),
        "keywords": keywords,
        "urgency": urgency,
    })
}
