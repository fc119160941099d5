use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crewflow_core::config::{ModelConfig, RetryConfig};
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::ModelClient;
use crewflow_core::types::*;

/// Wraps a primary model client with transient-error retries and an ordered
/// list of fallback providers.
///
/// Each provider in the chain gets the same retry budget. A provider that
/// fails with a non-transient error (bad key, unparseable response) hands
/// over to the next one immediately.
pub struct RetryingClient {
    primary: Box<dyn ModelClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn ModelClient>)>,
    retry: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn ModelClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn ModelClient>)>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry,
        }
    }

    async fn complete_with_retries(
        &self,
        client: &dyn ModelClient,
        config: &ModelConfig,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let mut attempt = 0;
        loop {
            match client.complete(config, request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(e) if is_transient(&e) && attempt < self.retry.max_retries => {
                    let wait = backoff(attempt, &self.retry);
                    warn!(
                        model = %config.model_id,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Transient model error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Rate limits, upstream 5xx and network failures.
fn is_transient(e: &CrewflowError) -> bool {
    const MARKERS: &[&str] = &["429", "500", "502", "503", "timeout", "connection"];
    match e {
        CrewflowError::ModelRequest(msg) => MARKERS.iter().any(|m| msg.contains(m)),
        _ => false,
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with ±20% jitter.
fn backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base as f64 * jitter) as u64)
}

impl ModelClient for RetryingClient {
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let chain = std::iter::once((&config, self.primary.as_ref())).chain(
                self.fallbacks
                    .iter()
                    .map(|(fb_config, fb_client)| (fb_config, fb_client.as_ref())),
            );

            let mut last_err = None;
            for (position, (provider_config, client)) in chain.enumerate() {
                if position > 0 {
                    info!(
                        model = %provider_config.model_id,
                        provider = %provider_config.provider,
                        "Falling back to alternative model"
                    );
                }
                match self
                    .complete_with_retries(client, provider_config, &request)
                    .await
                {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        warn!(model = %provider_config.model_id, error = %e, "Model provider failed");
                        last_err = Some(e);
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| CrewflowError::ModelRequest("no model provider configured".into())))
        })
    }
}
