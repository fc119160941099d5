use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crewflow_core::config::ModelConfig;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::ModelClient;
use crewflow_core::types::*;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Split system messages out; Anthropic takes them as a top-level field.
fn convert_messages(messages: Vec<ChatMessage>, json_mode: bool) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_parts = Vec::new();
    let mut api_messages = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content),
            Role::User => api_messages.push(ApiMessage {
                role: "user",
                content: msg.content,
            }),
            Role::Assistant => api_messages.push(ApiMessage {
                role: "assistant",
                content: msg.content,
            }),
        }
    }

    if json_mode {
        system_parts.push("Respond with a single JSON object and nothing else.".to_string());
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, api_messages)
}

fn parse_response(body: &str) -> Result<Completion> {
    let parsed: AnthropicResponse =
        serde_json::from_str(body).map_err(|e| CrewflowError::ModelParse(e.to_string()))?;

    let text = parsed
        .content
        .iter()
        .filter(|b| b.r#type == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

impl ModelClient for AnthropicClient {
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| CrewflowError::Config("Anthropic API key not set".into()))?;

            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);
            let (system, messages) = convert_messages(request.messages, request.json_mode);

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: (config.temperature > 0.0).then_some(config.temperature),
                system,
                messages,
            };

            let response = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| CrewflowError::ModelRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());

            if !status.is_success() {
                return Err(CrewflowError::ModelRequest(format!("HTTP {}: {}", status, text)));
            }

            debug!(model = %config.model_id, bytes = text.len(), "Anthropic completion received");
            parse_response(&text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_messages_are_hoisted() {
        let (system, messages) = convert_messages(
            vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            false,
        );
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn test_json_mode_adds_instruction() {
        let (system, _) = convert_messages(vec![ChatMessage::user("hi")], true);
        assert!(system.unwrap().contains("JSON object"));
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let body = r#"{
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "text", "text": "world"}
            ],
            "usage": {"input_tokens": 5, "output_tokens": 2}
        }"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "Hello, world");
        assert_eq!(completion.input_tokens, 5);
        assert_eq!(completion.output_tokens, 2);
    }
}
