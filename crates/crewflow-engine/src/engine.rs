use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::EventBus;
use crewflow_core::types::{NodeStatus, ProgressEvent, RunDefaults, RunId, WorkflowEvent};

use crate::context::{RunContext, Services};
use crate::definition::WorkflowDefinition;
use crate::executors::{ExecutorRegistry, StepInput};
use crate::graph::config::NodeConfig;
use crate::graph::node::{ErrorPolicy, Node};
use crate::graph::template::{self, Scope};
use crate::graph::{compile, CompiledGraph, Liveness, Outcome};
use crate::pool::VariablePool;
use crate::recorder::{NodeExecutionResult, RunRecorder, WorkflowExecutionResult};

/// Invoked once per node status transition.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Per-run parameters supplied by the caller.
#[derive(Clone)]
pub struct RunOptions {
    pub tenant_id: String,
    pub defaults: RunDefaults,
    pub cancel: CancellationToken,
    /// Generated when not set.
    pub run_id: Option<RunId>,
}

impl RunOptions {
    pub fn new(tenant_id: impl Into<String>, defaults: RunDefaults) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            defaults,
            cancel: CancellationToken::new(),
            run_id: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Compiles workflow definitions and runs them layer by layer.
pub struct WorkflowEngine {
    services: Arc<Services>,
    registry: ExecutorRegistry,
    event_bus: Option<Arc<EventBus>>,
    run_timeout: Option<Duration>,
}

impl WorkflowEngine {
    pub fn new(services: Services) -> Self {
        Self::with_registry(services, ExecutorRegistry::builtin())
    }

    pub fn with_registry(services: Services, registry: ExecutorRegistry) -> Self {
        Self {
            services: Arc::new(services),
            registry,
            event_bus: None,
            run_timeout: None,
        }
    }

    /// Publish run and node events on the given bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Abort runs that take longer than `limit`.
    pub fn with_run_timeout(mut self, limit: Duration) -> Self {
        self.run_timeout = Some(limit);
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Validate a definition and compute its layers without running anything.
    pub fn compile(&self, def: &WorkflowDefinition) -> Result<CompiledGraph> {
        compile(def, &self.registry)
    }

    /// Run a workflow to completion.
    ///
    /// Returns `Err` only when the definition is structurally invalid. Node
    /// failures, cancellation and timeouts are reported in the result.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        input: &str,
        options: RunOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<WorkflowExecutionResult> {
        let graph = self.compile(def)?;
        let run_id = options.run_id.unwrap_or_default();
        let cancel = options.cancel.child_token();

        let timer = self.run_timeout.map(|limit| {
            let token = cancel.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(run_id = %run_id, limit_ms = limit.as_millis() as u64, "Run timed out");
                token.cancel();
            })
        });

        let ctx = RunContext {
            run_id: run_id.clone(),
            input: input.to_string(),
            tenant_id: options.tenant_id,
            defaults: options.defaults,
            cancel,
            services: Arc::clone(&self.services),
        };

        let (sink, drain) = ProgressSink::new(run_id.clone(), self.event_bus.clone(), on_progress);

        info!(
            run_id = %run_id,
            tenant_id = %ctx.tenant_id,
            nodes = graph.len(),
            layers = graph.layers().len(),
            "Workflow run started"
        );
        self.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
        });

        let result = self.run_layers(&graph, &ctx, &sink).await;

        if let Some(timer) = timer {
            timer.abort();
        }
        drop(sink);
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                warn!(run_id = %run_id, error = %e, "Progress callback task failed");
            }
        }

        if result.success {
            info!(run_id = %run_id, duration_ms = result.total_duration_ms, "Workflow run completed");
        } else {
            warn!(
                run_id = %run_id,
                duration_ms = result.total_duration_ms,
                error = result.error.as_deref().unwrap_or(""),
                "Workflow run failed"
            );
        }
        self.publish(WorkflowEvent::RunFinished {
            run_id,
            success: result.success,
            total_duration_ms: result.total_duration_ms,
            error: result.error.clone(),
        });

        Ok(result)
    }

    async fn run_layers(
        &self,
        graph: &CompiledGraph,
        ctx: &RunContext,
        sink: &ProgressSink,
    ) -> WorkflowExecutionResult {
        let mut pool = VariablePool::new();
        let mut liveness = Liveness::new(graph);
        let mut recorder = RunRecorder::new(ctx.run_id.clone());

        let mut reached = 0;
        for (depth, layer) in graph.layers().iter().enumerate() {
            if recorder.has_failed() {
                break;
            }
            if ctx.cancel.is_cancelled() {
                recorder.fail(CrewflowError::RunAborted.to_string());
                break;
            }
            reached = depth + 1;

            let mut ready = Vec::with_capacity(layer.len());
            for &idx in layer {
                let node = &graph.node(idx).node;
                if !liveness.is_live(graph, idx) {
                    debug!(run_id = %ctx.run_id, node_id = %node.id, "Node skipped");
                    liveness.seal(graph, idx, Outcome::Skipped);
                    recorder.record(idle_result(node, NodeStatus::Skipped));
                    sink.emit(&node.id, NodeStatus::Skipped, None, None);
                    continue;
                }

                let upstream = upstream_for(graph, &liveness, &pool, idx, &ctx.input);
                let config = template::resolve_config(
                    &graph.node(idx).config,
                    &Scope::new(&pool, &ctx.input, &upstream),
                );
                sink.emit(&node.id, NodeStatus::Running, None, None);
                ready.push(Dispatch { idx, config, upstream });
            }

            debug!(run_id = %ctx.run_id, layer = depth, dispatched = ready.len(), "Dispatching layer");
            let runs = futures::future::join_all(
                ready
                    .into_iter()
                    .map(|d| self.run_node(graph, d, &pool, ctx)),
            )
            .await;

            for run in runs {
                self.seal_node(graph, run, &mut pool, &mut liveness, &mut recorder, sink);
            }
        }

        for layer in &graph.layers()[reached..] {
            for &idx in layer {
                recorder.record(idle_result(&graph.node(idx).node, NodeStatus::Pending));
            }
        }

        recorder.seal()
    }

    async fn run_node(
        &self,
        graph: &CompiledGraph,
        dispatch: Dispatch,
        pool: &VariablePool,
        ctx: &RunContext,
    ) -> NodeRun {
        let node = &graph.node(dispatch.idx).node;
        let started_at = Utc::now();
        let start = Instant::now();
        let mut attempts = 0u32;

        let result = match (self.registry.get(node.kind), dispatch.config) {
            (None, _) => Err(CrewflowError::NodeExecution {
                node: node.id.clone(),
                message: format!("no executor registered for kind {}", node.kind),
            }),
            (Some(_), Err(e)) => Err(e),
            (Some(executor), Ok(config)) => {
                let policy = executor.retry_policy(&config);
                loop {
                    attempts += 1;
                    let input = StepInput {
                        node_id: &node.id,
                        config: config.clone(),
                        upstream: dispatch.upstream.clone(),
                        pool,
                    };
                    let outcome = tokio::select! {
                        r = executor.execute(input, ctx) => r,
                        _ = ctx.cancel.cancelled() => Err(CrewflowError::RunAborted),
                    };
                    match outcome {
                        Ok(output) => break Ok(output),
                        Err(e) if policy.should_retry(attempts, &e) => {
                            warn!(
                                run_id = %ctx.run_id,
                                node_id = %node.id,
                                attempt = attempts,
                                error = %e,
                                "Node failed, retrying"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(policy.interval) => {}
                                _ = ctx.cancel.cancelled() => break Err(CrewflowError::RunAborted),
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        NodeRun {
            idx: dispatch.idx,
            result,
            attempts,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn seal_node(
        &self,
        graph: &CompiledGraph,
        run: NodeRun,
        pool: &mut VariablePool,
        liveness: &mut Liveness,
        recorder: &mut RunRecorder,
        sink: &ProgressSink,
    ) {
        let node = &graph.node(run.idx).node;
        let mut record = NodeExecutionResult {
            node_id: node.id.clone(),
            kind: node.kind,
            label: node.label().to_string(),
            status: NodeStatus::Completed,
            output: Value::Null,
            error: None,
            duration_ms: run.duration_ms,
            attempts: run.attempts,
            started_at: Some(run.started_at),
        };

        let failure = match run.result {
            Ok(output) => {
                match pool.insert(&node.id, output.clone()) {
                    Ok(()) => {
                        liveness.seal(graph, run.idx, Outcome::Completed(&output));
                        debug!(node_id = %node.id, duration_ms = run.duration_ms, "Node completed");
                        sink.emit(&node.id, NodeStatus::Completed, Some(output.clone()), None);
                        record.output = output;
                        None
                    }
                    Err(e) => Some(e),
                }
            }
            Err(e) => Some(e),
        };

        if let Some(err) = failure {
            let message = err.to_string();
            error!(node_id = %node.id, attempts = run.attempts, error = %message, "Node failed");
            record.status = NodeStatus::Failed;
            record.error = Some(message.clone());

            let aborted = matches!(err, CrewflowError::RunAborted);
            if !aborted && node.error_handling == ErrorPolicy::Continue {
                let fallback = node.fallback_output();
                liveness.seal(graph, run.idx, Outcome::Recovered);
                if pool.insert(&node.id, fallback.clone()).is_ok() {
                    record.output = fallback;
                }
            } else {
                recorder.fail(message.clone());
            }
            sink.emit(&node.id, NodeStatus::Failed, None, Some(message));
        }

        recorder.record(record);
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }
}

struct Dispatch {
    idx: usize,
    config: Result<NodeConfig>,
    upstream: Value,
}

struct NodeRun {
    idx: usize,
    result: Result<Value>,
    attempts: u32,
    started_at: chrono::DateTime<Utc>,
    duration_ms: u64,
}

/// Result for a node that never dispatched.
fn idle_result(node: &Node, status: NodeStatus) -> NodeExecutionResult {
    NodeExecutionResult {
        node_id: node.id.clone(),
        kind: node.kind,
        label: node.label().to_string(),
        status,
        output: Value::Null,
        error: None,
        duration_ms: 0,
        attempts: 0,
        started_at: None,
    }
}

/// The value a node receives along its satisfied incoming edges.
fn upstream_for(
    graph: &CompiledGraph,
    liveness: &Liveness,
    pool: &VariablePool,
    idx: usize,
    input: &str,
) -> Value {
    if graph.is_root(idx) {
        return Value::String(input.to_string());
    }
    let value_of = |id: &str| pool.get(id).cloned().unwrap_or(Value::Null);
    match liveness.live_sources(graph, idx).as_slice() {
        [single] => value_of(single),
        many => {
            let map: Map<String, Value> = many
                .iter()
                .map(|id| (id.to_string(), value_of(id)))
                .collect();
            Value::Object(map)
        }
    }
}

/// Fans node transitions out to the progress callback and the event bus.
///
/// The callback runs on its own task behind an unbounded channel.
struct ProgressSink {
    run_id: RunId,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
    bus: Option<Arc<EventBus>>,
}

impl ProgressSink {
    fn new(
        run_id: RunId,
        bus: Option<Arc<EventBus>>,
        callback: Option<ProgressCallback>,
    ) -> (Self, Option<tokio::task::JoinHandle<()>>) {
        let (tx, drain) = match callback {
            Some(callback) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
                let handle = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        callback(event);
                    }
                });
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };
        (Self { run_id, tx, bus }, drain)
    }

    fn emit(&self, node_id: &str, status: NodeStatus, output: Option<Value>, error: Option<String>) {
        let event = ProgressEvent {
            node_id: node_id.to_string(),
            status,
            output,
            error,
        };
        if let Some(ref bus) = self.bus {
            bus.publish(WorkflowEvent::NodeProgress {
                run_id: self.run_id.clone(),
                event: event.clone(),
            });
        }
        if let Some(ref tx) = self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use futures::future::BoxFuture;
    use serde_json::json;

    use crewflow_core::traits::ModelClient;
    use crewflow_test_utils::{test_model_config, MemoryKnowledgeBase, MockModelClient, WorkflowJson};

    use crate::sandbox::{ScriptRequest, ScriptRuntime};

    fn options() -> RunOptions {
        RunOptions::new("acme", RunDefaults::new(test_model_config()))
    }

    fn services() -> Services {
        Services::new(Arc::new(MockModelClient::new()) as Arc<dyn ModelClient>)
    }

    fn definition(value: Value) -> WorkflowDefinition {
        WorkflowDefinition::from_value(value).unwrap()
    }

    /// Fails the first `failures` invocations, then returns the call count.
    struct FlakyRuntime {
        failures: usize,
        calls: AtomicUsize,
    }

    impl ScriptRuntime for FlakyRuntime {
        fn run(&self, _request: ScriptRequest) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.failures {
                    return Err(CrewflowError::Script(format!("flaky failure {}", n)));
                }
                Ok(json!(n))
            })
        }
    }

    #[tokio::test]
    async fn test_progress_transitions_in_order() {
        let engine = WorkflowEngine::new(services());
        let def = definition(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .node("end", "output", json!({}))
                .edge("start", "end")
                .build(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |ev: ProgressEvent| {
            sink.lock().unwrap().push(format!("{}:{}", ev.node_id, ev.status));
        });

        let result = engine
            .execute(&def, "hello", options(), Some(callback))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.final_output, json!("hello"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["start:running", "start:completed", "end:running", "end:completed"]
        );
    }

    #[tokio::test]
    async fn test_events_published_on_bus() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let engine = WorkflowEngine::new(services()).with_event_bus(bus);
        let def = definition(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .build(),
        );
        engine.execute(&def, "x", options(), None).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::RunStarted { .. } => "started".to_string(),
                WorkflowEvent::NodeProgress { event, .. } => event.status.to_string(),
                WorkflowEvent::RunFinished { success, .. } => format!("finished:{}", success),
                WorkflowEvent::TriggerFired { .. } => "fired".to_string(),
            });
        }
        assert_eq!(kinds, vec!["started", "running", "completed", "finished:true"]);
    }

    #[tokio::test]
    async fn test_join_receives_object_keyed_by_source() {
        let engine = WorkflowEngine::new(services());
        let def = definition(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .node("a", "output", json!({"value": 1}))
                .node("b", "output", json!({"value": "two"}))
                .node("join", "output", json!({}))
                .edge("start", "a")
                .edge("start", "b")
                .edge("b", "join")
                .edge("a", "join")
                .build(),
        );
        let result = engine.execute(&def, "", options(), None).await.unwrap();
        let join = result.node("join").unwrap();
        assert_eq!(join.output, json!({"b": "two", "a": 1}));
        assert_eq!(result.final_output, join.output);
    }

    #[tokio::test]
    async fn test_script_retries_counted() {
        let runtime = Arc::new(FlakyRuntime {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let engine = WorkflowEngine::new(services().with_script_runtime(runtime));
        let def = definition(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .node(
                    "calc",
                    "script",
                    json!({"code": "function main() {}", "retryCount": 2, "retryInterval": 20}),
                )
                .edge("start", "calc")
                .build(),
        );
        let result = engine.execute(&def, "", options(), None).await.unwrap();
        let calc = result.node("calc").unwrap();
        assert!(result.success);
        assert_eq!(calc.status, NodeStatus::Completed);
        assert_eq!(calc.attempts, 3);
        assert_eq!(calc.output, json!(3));
        assert!(calc.duration_ms >= 40);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_run() {
        let runtime = Arc::new(FlakyRuntime {
            failures: 5,
            calls: AtomicUsize::new(0),
        });
        let engine = WorkflowEngine::new(services().with_script_runtime(runtime));
        let def = definition(
            WorkflowJson::new()
                .node("calc", "script", json!({"code": "function main() {}", "retryCount": 1}))
                .node("end", "output", json!({}))
                .edge("calc", "end")
                .build(),
        );
        let result = engine.execute(&def, "", options(), None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.node("calc").unwrap().attempts, 2);
        assert_eq!(result.error.as_deref(), Some("Script error: flaky failure 2"));
        let end = result.node("end").unwrap();
        assert_eq!(end.status, NodeStatus::Pending);
        assert_eq!(end.attempts, 0);
        assert_eq!(result.final_output, Value::Null);
    }

    #[tokio::test]
    async fn test_run_timeout_aborts() {
        let kb = MemoryKnowledgeBase::new()
            .with_document("slow", "1", "Doc", "text")
            .with_delay("slow", Duration::from_secs(5));
        let engine = WorkflowEngine::new(services().with_knowledge_base(Arc::new(kb)))
            .with_run_timeout(Duration::from_millis(50));
        let def = definition(
            WorkflowJson::new()
                .node("lookup", "retrieval", json!({"knowledgeBaseId": "slow"}))
                .build(),
        );
        let caller = CancellationToken::new();
        let result = engine
            .execute(&def, "text", options().with_cancel(caller.clone()), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("run aborted"));
        assert!(!caller.is_cancelled());
    }

    #[test]
    fn test_upstream_for_root_is_raw_input() {
        let registry = ExecutorRegistry::builtin();
        let def = definition(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .node("end", "output", json!({}))
                .edge("start", "end")
                .build(),
        );
        let graph = compile(&def, &registry).unwrap();
        let liveness = Liveness::new(&graph);
        let pool = VariablePool::new();
        assert_eq!(upstream_for(&graph, &liveness, &pool, 0, "raw"), json!("raw"));
        // Nothing satisfied yet: an empty object.
        assert_eq!(upstream_for(&graph, &liveness, &pool, 1, "raw"), json!({}));
    }
}
