//! Mocks and fixtures shared by Crewflow tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crewflow_core::config::ModelConfig;
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::{AgentDelegate, KnowledgeBase, Mailer, ModelClient, SiteNotifier};
use crewflow_core::types::*;

/// Model config pointing nowhere; only mocks consume it.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "mock".into(),
        model_id: "mock-model".into(),
        api_key: None,
        base_url: None,
        max_tokens: 256,
        temperature: 0.0,
        retry: None,
    }
}

type Handler = Box<dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync>;

/// Scripted model client. Queued responses are returned first, then the
/// handler (if any) answers, otherwise an empty string.
pub struct MockModelClient {
    queue: Mutex<VecDeque<Result<String>>>,
    handler: Option<Handler>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: None,
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.queue.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn with_error(self, err: CrewflowError) -> Self {
        self.queue.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        self.requests.clone()
    }
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient for MockModelClient {
    fn complete(
        &self,
        _config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let queued = self.queue.lock().unwrap().pop_front();
            let text = match queued {
                Some(result) => result?,
                None => match self.handler {
                    Some(ref handler) => handler(&request)?,
                    None => String::new(),
                },
            };
            self.requests.lock().unwrap().push(request);
            Ok(Completion {
                text,
                input_tokens: 0,
                output_tokens: 0,
            })
        })
    }
}

/// In-memory knowledge base with optional per-base latency.
#[derive(Default)]
pub struct MemoryKnowledgeBase {
    docs: HashMap<String, Vec<KnowledgeHit>>,
    delays: HashMap<String, Duration>,
}

impl MemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, kb: &str, id: &str, title: &str, content: &str) -> Self {
        self.docs.entry(kb.to_string()).or_default().push(KnowledgeHit {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            score: 0.0,
        });
        self
    }

    pub fn with_delay(mut self, kb: &str, delay: Duration) -> Self {
        self.delays.insert(kb.to_string(), delay);
        self
    }
}

impl KnowledgeBase for MemoryKnowledgeBase {
    fn search(
        &self,
        _tenant_id: &str,
        knowledge_base_id: &str,
        query: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<KnowledgeHit>>> {
        let kb = knowledge_base_id.to_string();
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        Box::pin(async move {
            if let Some(delay) = self.delays.get(&kb) {
                tokio::time::sleep(*delay).await;
            }
            let mut hits: Vec<KnowledgeHit> = self
                .docs
                .get(&kb)
                .map(|docs| {
                    docs.iter()
                        .filter_map(|d| {
                            let lower = d.content.to_lowercase();
                            let score = words.iter().filter(|w| lower.contains(w.as_str())).count();
                            (score > 0 || words.is_empty()).then(|| KnowledgeHit {
                                score: score as f64,
                                ..d.clone()
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(top_k);
            Ok(hits)
        })
    }
}

/// Records site notices; optionally fails every post.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Arc<Mutex<Vec<SiteNotice>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            notices: Arc::default(),
            fail: true,
        }
    }
}

impl SiteNotifier for RecordingNotifier {
    fn post(&self, notice: SiteNotice) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(CrewflowError::Notification("site notice board unavailable".into()));
            }
            self.notices.lock().unwrap().push(notice);
            Ok(())
        })
    }
}

/// Records emails; optionally fails every send.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Arc<Mutex<Vec<EmailMessage>>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.fail {
                return Err(CrewflowError::Notification("SMTP relay rejected message".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }
}

/// Delegate that answers with `"{agent}: {message}"`.
pub struct EchoDelegate;

impl AgentDelegate for EchoDelegate {
    fn ask(
        &self,
        _tenant_id: &str,
        agent_id: &str,
        message: String,
    ) -> BoxFuture<'_, Result<String>> {
        let reply = format!("{}: {}", agent_id, message);
        Box::pin(async move { Ok(reply) })
    }
}

/// Builder for workflow definition JSON.
#[derive(Default)]
pub struct WorkflowJson {
    nodes: Vec<Value>,
    edges: Vec<Value>,
}

impl WorkflowJson {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, id: &str, kind: &str, config: Value) -> Self {
        self.nodes.push(json!({ "id": id, "type": kind, "config": config }));
        self
    }

    /// Add a node with `errorHandling: "continue"`.
    pub fn continuing_node(mut self, id: &str, kind: &str, config: Value) -> Self {
        self.nodes.push(json!({
            "id": id,
            "type": kind,
            "config": config,
            "errorHandling": "continue"
        }));
        self
    }

    pub fn edge(mut self, source: &str, target: &str) -> Self {
        let id = format!("e{}", self.edges.len() + 1);
        self.edges.push(json!({ "id": id, "source": source, "target": target }));
        self
    }

    pub fn branch(mut self, source: &str, target: &str, tag: &str) -> Self {
        let id = format!("e{}", self.edges.len() + 1);
        self.edges.push(json!({
            "id": id,
            "source": source,
            "target": target,
            "branchTag": tag
        }));
        self
    }

    pub fn build(self) -> Value {
        json!({ "nodes": self.nodes, "edges": self.edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_model_queue_then_handler() {
        let client = MockModelClient::new()
            .with_response("first")
            .with_handler(|req| Ok(format!("echo {}", req.messages.len())));
        let req = CompletionRequest::new(vec![ChatMessage::user("x")]);
        let a = client.complete(&test_model_config(), req.clone()).await.unwrap();
        let b = client.complete(&test_model_config(), req).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "echo 1");
        assert_eq!(client.call_counter().load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memory_knowledge_base_ranks_matches() {
        let kb = MemoryKnowledgeBase::new()
            .with_document("kb", "1", "Refunds", "refund policy for orders")
            .with_document("kb", "2", "Shipping", "shipping times")
            .with_document("kb", "3", "Refund window", "refund window is 30 days for orders");
        let hits = kb.search("t", "kb", "refund orders", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.id != "2"));
    }

    #[test]
    fn test_workflow_json_builder() {
        let wf = WorkflowJson::new()
            .node("a", "trigger", json!({}))
            .node("b", "output", json!({}))
            .branch("a", "b", "true")
            .build();
        assert_eq!(wf["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(wf["edges"][0]["branchTag"], "true");
        assert_eq!(wf["edges"][0]["id"], "e1");
    }
}
