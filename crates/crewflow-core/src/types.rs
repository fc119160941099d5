use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ModelConfig;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Step kind discriminator.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[serde(alias = "start")]
    Trigger,
    #[serde(alias = "model")]
    Process,
    Script,
    Http,
    Condition,
    Notification,
    Retrieval,
    Classifier,
    Aggregator,
    Delegate,
    #[serde(alias = "end")]
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Process => "process",
            Self::Script => "script",
            Self::Http => "http",
            Self::Condition => "condition",
            Self::Notification => "notification",
            Self::Retrieval => "retrieval",
            Self::Classifier => "classifier",
            Self::Aggregator => "aggregator",
            Self::Delegate => "delegate",
            Self::Output => "output",
        }
    }

    /// Kinds whose output carries a branch selector.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition | Self::Classifier)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single node within a run.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Defaults a run inherits from the invoking agent.
#[derive(Debug, Clone)]
pub struct RunDefaults {
    pub model: ModelConfig,
    pub credentials: HashMap<String, String>,
}

impl RunDefaults {
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            credentials: HashMap::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// One node status transition, streamed to progress consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Run started.
    RunStarted { run_id: RunId, tenant_id: String },
    /// A node changed status.
    NodeProgress { run_id: RunId, event: ProgressEvent },
    /// Run sealed.
    RunFinished {
        run_id: RunId,
        success: bool,
        total_duration_ms: u64,
        error: Option<String>,
    },
    /// A scheduled trigger fired.
    TriggerFired { agent_id: String, run_id: RunId },
}

/// Role in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }
}

/// A single non-streaming completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            json_mode: false,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A document returned from a knowledge base search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeHit {
    pub id: String,
    pub title: String,
    pub content: String,
    pub score: f64,
}

/// An in-app notice addressed to a tenant (and optionally specific users).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteNotice {
    pub tenant_id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}
