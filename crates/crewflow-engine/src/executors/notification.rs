use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::{EmailMessage, NodeKind, SiteNotice};

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;

/// Delivers a message over the site notice board and/or email.
///
/// Output reports each attempted channel as `{delivered, error?}`. The step
/// only fails when every attempted channel failed.
pub struct NotificationExecutor;

impl StepExecutor for NotificationExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Notification
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Notification(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Notification));
            };
            let message = config.message.clone().unwrap_or_else(|| input.upstream_text());
            let mut report = Map::new();

            if config.site {
                let result = match ctx.services.notifier {
                    Some(ref notifier) => {
                        notifier
                            .post(SiteNotice {
                                tenant_id: ctx.tenant_id.clone(),
                                title: config.title.clone(),
                                message: message.clone(),
                                recipients: config.recipients.clone(),
                                created_at: Utc::now(),
                            })
                            .await
                    }
                    None => Err(CrewflowError::Notification(
                        "no site notifier configured".into(),
                    )),
                };
                report.insert("site".into(), channel_report(input.node_id, "site", result));
            }

            if let Some(ref target) = config.email {
                let result = match ctx.services.mailer {
                    Some(ref mailer) => {
                        mailer
                            .send(EmailMessage {
                                to: target.to.clone(),
                                subject: target
                                    .subject
                                    .clone()
                                    .unwrap_or_else(|| config.title.clone()),
                                body: message.clone(),
                            })
                            .await
                    }
                    None => Err(CrewflowError::Notification("no mailer configured".into())),
                };
                report.insert("email".into(), channel_report(input.node_id, "email", result));
            }

            let delivered = report
                .values()
                .filter(|r| r["delivered"] == Value::Bool(true))
                .count();
            if !report.is_empty() && delivered == 0 {
                let reasons: Vec<String> = report
                    .iter()
                    .map(|(channel, r)| format!("{}: {}", channel, r["error"].as_str().unwrap_or("")))
                    .collect();
                return Err(CrewflowError::Notification(reasons.join("; ")));
            }

            info!(node_id = %input.node_id, delivered, "Notification sent");
            Ok(Value::Object(report))
        })
    }
}

fn channel_report(node_id: &str, channel: &str, result: Result<()>) -> Value {
    match result {
        Ok(()) => json!({ "delivered": true }),
        Err(e) => {
            warn!(node_id, channel, error = %e, "Notification channel failed");
            json!({ "delivered": false, "error": e.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::executors::test_support::{context, services};
    use crate::pool::VariablePool;
    use crewflow_test_utils::{MockModelClient, RecordingMailer, RecordingNotifier};
    use std::sync::Arc;

    fn config(raw: Value) -> NodeConfig {
        NodeConfig::parse(NodeKind::Notification, &raw).unwrap()
    }

    async fn notify(svc: Services, raw: Value) -> Result<Value> {
        let ctx = context("", svc);
        let pool = VariablePool::new();
        NotificationExecutor
            .execute(
                StepInput {
                    node_id: "alert",
                    config: config(raw),
                    upstream: json!("Disk usage at 91%"),
                    pool: &pool,
                },
                &ctx,
            )
            .await
    }

    #[tokio::test]
    async fn test_site_and_email_delivered() {
        let notifier = Arc::new(RecordingNotifier::new());
        let mailer = Arc::new(RecordingMailer::new());
        let notices = notifier.notices.clone();
        let sent = mailer.sent.clone();
        let svc = services(MockModelClient::new())
            .with_notifier(notifier)
            .with_mailer(mailer);

        let out = notify(
            svc,
            json!({
                "title": "Ops alert",
                "site": true,
                "recipients": ["u1"],
                "email": {"to": ["ops@example.com"]}
            }),
        )
        .await
        .unwrap();

        assert_eq!(out, json!({"site": {"delivered": true}, "email": {"delivered": true}}));
        let notices = notices.lock().unwrap();
        assert_eq!(notices[0].tenant_id, "acme");
        assert_eq!(notices[0].message, "Disk usage at 91%");
        assert_eq!(notices[0].recipients, vec!["u1".to_string()]);
        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Ops alert");
        assert_eq!(sent[0].to, vec!["ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_partial_failure_still_succeeds() {
        let svc = services(MockModelClient::new())
            .with_notifier(Arc::new(RecordingNotifier::failing()))
            .with_mailer(Arc::new(RecordingMailer::new()));
        let out = notify(
            svc,
            json!({"title": "t", "site": true, "email": {"to": ["a@b.c"], "subject": "s"}}),
        )
        .await
        .unwrap();
        assert_eq!(out["site"]["delivered"], false);
        assert!(out["site"]["error"].as_str().unwrap().contains("unavailable"));
        assert_eq!(out["email"]["delivered"], true);
    }

    #[tokio::test]
    async fn test_all_channels_failed() {
        let svc = services(MockModelClient::new())
            .with_mailer(Arc::new(RecordingMailer::failing()));
        let err = notify(
            svc,
            json!({"title": "t", "site": true, "email": {"to": ["a@b.c"]}}),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, CrewflowError::Notification(_)));
        assert!(msg.contains("no site notifier configured"));
        assert!(msg.contains("SMTP relay rejected"));
    }
}
