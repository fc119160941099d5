use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crewflow_core::config::{HttpConfig, SandboxConfig};
use crewflow_core::traits::{AgentDelegate, KnowledgeBase, Mailer, ModelClient, SiteNotifier};
use crewflow_core::types::{RunDefaults, RunId};

use crate::sandbox::{BoaSandbox, ScriptRuntime};

/// Collaborators shared by every run of an engine.
///
/// Only the model client is mandatory; steps that need a missing
/// collaborator fail at execution time.
pub struct Services {
    pub model: Arc<dyn ModelClient>,
    pub knowledge: Option<Arc<dyn KnowledgeBase>>,
    pub notifier: Option<Arc<dyn SiteNotifier>>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub delegate: Option<Arc<dyn AgentDelegate>>,
    pub scripts: Arc<dyn ScriptRuntime>,
    pub http: reqwest::Client,
    pub http_timeout: Duration,
    pub script_timeout: Duration,
}

impl Services {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        let sandbox = SandboxConfig::default();
        let http = HttpConfig::default();
        Self {
            model,
            knowledge: None,
            notifier: None,
            mailer: None,
            delegate: None,
            script_timeout: Duration::from_millis(sandbox.default_timeout_ms),
            scripts: Arc::new(BoaSandbox::new(sandbox)),
            http: build_http_client(&http),
            http_timeout: Duration::from_millis(http.default_timeout_ms),
        }
    }

    pub fn with_knowledge_base(mut self, kb: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(kb);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SiteNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn AgentDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Use the boa sandbox with the given limits.
    pub fn with_sandbox(mut self, config: SandboxConfig) -> Self {
        self.script_timeout = Duration::from_millis(config.default_timeout_ms);
        self.scripts = Arc::new(BoaSandbox::new(config));
        self
    }

    /// Replace the script runtime entirely.
    pub fn with_script_runtime(mut self, runtime: Arc<dyn ScriptRuntime>) -> Self {
        self.scripts = runtime;
        self
    }

    pub fn with_http(mut self, config: &HttpConfig) -> Self {
        self.http = build_http_client(config);
        self.http_timeout = Duration::from_millis(config.default_timeout_ms);
        self
    }
}

fn build_http_client(config: &HttpConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .build()
        .unwrap_or_default()
}

/// Everything a step can see about the run it belongs to.
pub struct RunContext {
    pub run_id: RunId,
    /// Raw trigger input.
    pub input: String,
    pub tenant_id: String,
    pub defaults: RunDefaults,
    pub cancel: CancellationToken,
    pub services: Arc<Services>,
}
