use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::types::{KnowledgeHit, NodeKind};

use super::{StepExecutor, StepInput};
use crate::context::RunContext;
use crate::graph::NodeConfig;

/// Searches a tenant knowledge base and returns `{query, documents, context}`.
pub struct RetrievalExecutor;

impl StepExecutor for RetrievalExecutor {
    fn kind(&self) -> NodeKind {
        NodeKind::Retrieval
    }

    fn execute<'a>(
        &'a self,
        input: StepInput<'a>,
        ctx: &'a RunContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let NodeConfig::Retrieval(config) = &input.config else {
                return Err(input.mismatch(NodeKind::Retrieval));
            };
            let kb = ctx
                .services
                .knowledge
                .as_ref()
                .ok_or_else(|| CrewflowError::Retrieval("no knowledge base configured".into()))?;
            let query = config.query.clone().unwrap_or_else(|| input.upstream_text());

            let hits = kb
                .search(&ctx.tenant_id, &config.knowledge_base_id, &query, config.top_k)
                .await?;
            debug!(
                node_id = %input.node_id,
                knowledge_base = %config.knowledge_base_id,
                hits = hits.len(),
                "Knowledge base searched"
            );

            Ok(json!({
                "query": query,
                "context": render_context(&hits),
                "documents": hits,
            }))
        })
    }
}

/// `[1] title\ncontent` blocks separated by blank lines.
fn render_context(hits: &[KnowledgeHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("[{}] {}\n{}", i + 1, hit.title, hit.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crate::executors::test_support::{context, services};
    use crate::pool::VariablePool;
    use crewflow_test_utils::{MemoryKnowledgeBase, MockModelClient};
    use std::sync::Arc;

    async fn retrieve(svc: Services, raw: Value) -> Result<Value> {
        let ctx = context("", svc);
        let pool = VariablePool::new();
        RetrievalExecutor
            .execute(
                StepInput {
                    node_id: "lookup",
                    config: NodeConfig::parse(NodeKind::Retrieval, &raw).unwrap(),
                    upstream: json!("refund window"),
                    pool: &pool,
                },
                &ctx,
            )
            .await
    }

    #[tokio::test]
    async fn test_query_defaults_to_upstream() {
        let kb = MemoryKnowledgeBase::new()
            .with_document("policies", "p1", "Refunds", "The refund window is 30 days.")
            .with_document("policies", "p2", "Shipping", "Orders ship in 2 days.");
        let svc = services(MockModelClient::new()).with_knowledge_base(Arc::new(kb));

        let out = retrieve(svc, json!({"knowledgeBaseId": "policies", "topK": 3}))
            .await
            .unwrap();
        assert_eq!(out["query"], "refund window");
        assert_eq!(out["documents"].as_array().unwrap().len(), 1);
        assert_eq!(out["context"], "[1] Refunds\nThe refund window is 30 days.");
    }

    #[tokio::test]
    async fn test_missing_knowledge_base() {
        let svc = services(MockModelClient::new());
        let err = retrieve(svc, json!({"knowledgeBaseId": "policies"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CrewflowError::Retrieval(_)));
    }

    #[test]
    fn test_render_context_numbering() {
        let hit = |t: &str| KnowledgeHit {
            id: t.into(),
            title: t.into(),
            content: format!("{} body", t),
            score: 1.0,
        };
        assert_eq!(
            render_context(&[hit("a"), hit("b")]),
            "[1] a\na body\n\n[2] b\nb body"
        );
        assert_eq!(render_context(&[]), "");
    }
}
