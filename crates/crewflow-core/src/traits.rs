use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Model client. One provider adapter per implementation.
pub trait ModelClient: Send + Sync + 'static {
    /// Send a completion request and wait for the full response.
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<Completion>>;
}

/// Knowledge base backing retrieval steps.
pub trait KnowledgeBase: Send + Sync + 'static {
    fn search(
        &self,
        tenant_id: &str,
        knowledge_base_id: &str,
        query: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<KnowledgeHit>>>;
}

/// In-app notice delivery.
pub trait SiteNotifier: Send + Sync + 'static {
    fn post(&self, notice: SiteNotice) -> BoxFuture<'_, Result<()>>;
}

/// Email delivery.
pub trait Mailer: Send + Sync + 'static {
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>>;
}

/// Forwards work to another agent and returns its reply.
pub trait AgentDelegate: Send + Sync + 'static {
    fn ask(
        &self,
        tenant_id: &str,
        agent_id: &str,
        message: String,
    ) -> BoxFuture<'_, Result<String>>;
}
