pub mod providers;
pub mod retry;

use crewflow_core::config::ModelConfig;
use crewflow_core::traits::ModelClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create a model client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn ModelClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}
