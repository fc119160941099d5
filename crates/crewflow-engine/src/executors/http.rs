use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::NodeKind;

use super::{RetryPolicy, StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::template;
use crate::graph::NodeConfig;

/// Calls an HTTP endpoint and returns `{status, headers, body}`.
pub struct HttpExecutor;

impl StepExecutor for HttpExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Http
    }

    fn retry_policy(&self, config: &NodeConfig) -> RetryPolicy {
        match config {
            NodeConfig::Http(c) => RetryPolicy {
                max_retries: c.retry_count,
                interval: Duration::from_millis(c.retry_interval),
                retryable_only: true,
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
            let NodeConfig::Http(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Http));
            };

            let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
                .map_err(|e| CrewflowError::HttpRequest(e.to_string()))?;
            let timeout = config
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(ctx.services.http_timeout);

            let mut req = ctx
                .services
                .http
                .request(method.clone(), &config.url)
                .timeout(timeout);

            for (name, value) in &config.headers {
                req = req.header(name.as_str(), template::display(value));
            }

            if let Some(ref key) = config.auth {
                let token = ctx.defaults.credentials.get(key).ok_or_else(|| {
                    CrewflowError::NodeExecution {
                        node: input.node_id.to_string(),
                        message: format!("credential '{}' is not available", key),
                    }
                })?;
                req = req.bearer_auth(token);
            }

            if method != Method::GET && method != Method::HEAD {
                match config.body {
                    Some(Value::String(ref text)) => req = req.body(text.clone()),
                    Some(Value::Null) | None => {}
                    Some(ref other) => req = req.json(other),
                }
            }

            let response = req
                .send()
                .await
                .map_err(|e| CrewflowError::HttpRequest(e.to_string()))?;

            let status = response.status();
            let mut headers = Map::new();
            for (name, value) in response.headers() {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.as_str().to_string(), Value::String(v.to_string()));
                }
            }
            let text = response
                .text()
                .await
                .map_err(|e| CrewflowError::HttpRequest(e.to_string()))?;
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

            debug!(
                node_id = %input.node_id,
                url = %config.url,
                status = status.as_u16(),
                "HTTP step finished"
            );

            if !status.is_success() {
                return Err(CrewflowError::HttpStatus {
                    status: status.as_u16(),
                    body: template::display(&body),
                });
            }

            Ok(json!({
                "status": status.as_u16(),
                "headers": headers,
                "body": body,
            }))
        })
    }
}
