use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crewflow_core::event::EventBus;
use crewflow_core::types::{RunId, WorkflowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crashed process still leaves every earlier entry intact.
pub struct RunLogger {
    log_dir: PathBuf,
    open: HashMap<RunId, BufWriter<File>>,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            open: HashMap::new(),
        }
    }

    /// Subscribe now and log on a background task until cancelled or the bus closes.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(mut self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), "RunLogger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Write out whatever was published before cancellation.
                    loop {
                        match rx.try_recv() {
                            Ok(event) => self.handle(&event).await,
                            Err(TryRecvError::Lagged(n)) => debug!(skipped = n, "RunLogger lagged"),
                            Err(_) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => self.handle(&event).await,
                    Err(RecvError::Lagged(n)) => debug!(skipped = n, "RunLogger lagged, skipped events"),
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            }
        }

        for (_, mut writer) in self.open.drain() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn handle(&mut self, event: &WorkflowEvent) {
        let Some((run_id, entry)) = to_entry(event) else {
            return;
        };
        let line = match serde_json::to_string(&entry) {
            Ok(json) => format!("{}\n", json),
            Err(e) => {
                error!(error = %e, "Failed to serialize log entry");
                return;
            }
        };
        let finished = matches!(event, WorkflowEvent::RunFinished { .. });

        if !self.open.contains_key(run_id) {
            let path = self.log_dir.join(format!("{}.jsonl", run_id));
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    self.open.insert(run_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open run log");
                    return;
                }
            }
        }

        if let Some(writer) = self.open.get_mut(run_id) {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, run_id = %run_id, "Failed to write log entry");
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, run_id = %run_id, "Failed to flush run log");
            }
        }
        if finished {
            self.open.remove(run_id);
        }
    }
}

fn to_entry(event: &WorkflowEvent) -> Option<(&RunId, LogEntry<'_>)> {
    let timestamp = Utc::now().to_rfc3339();
    match event {
        WorkflowEvent::RunStarted { run_id, tenant_id } => Some((
            run_id,
            LogEntry {
                timestamp,
                run_id: &run_id.0,
                event_type: "run_started",
                node_id: None,
                detail: Some(serde_json::json!({ "tenant_id": tenant_id })),
            },
        )),
        WorkflowEvent::NodeProgress { run_id, event } => Some((
            run_id,
            LogEntry {
                timestamp,
                run_id: &run_id.0,
                event_type: "node_progress",
                node_id: Some(&event.node_id),
                detail: Some(serde_json::json!({
                    "status": event.status,
                    "output": event.output,
                    "error": event.error,
                })),
            },
        )),
        WorkflowEvent::RunFinished {
            run_id,
            success,
            total_duration_ms,
            error,
        } => Some((
            run_id,
            LogEntry {
                timestamp,
                run_id: &run_id.0,
                event_type: "run_finished",
                node_id: None,
                detail: Some(serde_json::json!({
                    "success": success,
                    "total_duration_ms": total_duration_ms,
                    "error": error,
                })),
            },
        )),
        WorkflowEvent::TriggerFired { .. } => None,
    }
}
