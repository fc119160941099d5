use futures::future::BoxFuture;
use tracing::{debug, warn};

use crewflow_core::config::EmailConfig;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::Mailer;
use crewflow_core::types::EmailMessage;

/// Sends email through an HTTP relay.
///
/// Each message is POSTed as `{from, to, subject, text}` JSON; any non-2xx
/// reply is a delivery failure.
pub struct HttpMailer {
    config: EmailConfig,
    http: reqwest::Client,
}

impl HttpMailer {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

impl Mailer for HttpMailer {
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if message.to.is_empty() {
                return Err(CrewflowError::Notification("email has no recipients".into()));
            }

            let mut req = self.http.post(&self.config.endpoint).json(&serde_json::json!({
                "from": self.config.from,
                "to": message.to,
                "subject": message.subject,
                "text": message.body,
            }));
            if let Some(ref key) = self.config.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| CrewflowError::Notification(format!("email relay unreachable: {e}")))?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "Email relay rejected message");
                return Err(CrewflowError::Notification(format!(
                    "email relay returned {}: {}",
                    status.as_u16(),
                    body
                )));
            }

            debug!(recipients = message.to.len(), subject = %message.subject, "Email sent");
            Ok(())
        })
    }
}
