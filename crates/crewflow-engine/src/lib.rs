pub mod agents;
pub mod context;
pub mod definition;
pub mod engine;
pub mod executors;
pub mod graph;
pub mod pool;
pub mod recorder;
pub mod run_log;
pub mod sandbox;
pub mod triggers;

pub use agents::ModelDelegate;
pub use context::{RunContext, Services};
pub use definition::WorkflowDefinition;
pub use engine::{ProgressCallback, RunOptions, WorkflowEngine};
pub use executors::{ExecutorRegistry, RetryPolicy, StepExecutor, StepInput};
pub use graph::{compile, CompiledGraph, Edge, ErrorPolicy, Node, NodeConfig};
pub use pool::VariablePool;
pub use recorder::{NodeExecutionResult, RunRecorder, WorkflowExecutionResult};
pub use run_log::RunLogger;
pub use sandbox::{BoaSandbox, ScriptRequest, ScriptRuntime};
pub use triggers::{RegisteredTrigger, TriggerRegistry};
