//! JavaScript sandbox for script steps.
//!
//! Each invocation gets a fresh boa context with no host bindings. Globals
//! outside the allow-list are removed before user code runs.
//!
//! Scripts are evaluated in instruction budgets. Between budgets the
//! interpreter checks its deadline and a stop flag that is raised when the
//! caller stops waiting, so a timed-out or cancelled script releases its
//! blocking thread instead of spinning on it. The loop-iteration and
//! recursion limits still apply to code running under native callbacks,
//! which do not yield.

use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use boa_engine::{Context, Script, Source};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crewflow_core::config::SandboxConfig;
use crewflow_core::error::{CrewflowError, Result};

/// A single script invocation.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub code: String,
    /// Passed to `main` as its only argument. Each top-level key is also
    /// bound as a local variable.
    pub args: serde_json::Map<String, Value>,
    pub timeout: Duration,
}

/// Runs user scripts.
pub trait ScriptRuntime: Send + Sync + 'static {
    fn run(&self, request: ScriptRequest) -> BoxFuture<'_, Result<Value>>;
}

const ALLOWED_GLOBALS: &[&str] = &[
    "globalThis",
    "undefined",
    "NaN",
    "Infinity",
    "JSON",
    "Math",
    "Number",
    "String",
    "Boolean",
    "Array",
    "Object",
    "Date",
    "RegExp",
    "Map",
    "Set",
    "Symbol",
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURIComponent",
    "decodeURIComponent",
    "encodeURI",
    "decodeURI",
];

/// VM cost units executed between deadline checks.
const EVAL_BUDGET: u32 = 4096;

/// Deadline and stop flag checked by the interpreter between budgets.
#[derive(Debug, Clone)]
struct Interrupt {
    deadline: Option<Instant>,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl Interrupt {
    fn check(&self) -> Result<()> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(CrewflowError::Script("script interrupted".into()));
        }
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            return Err(CrewflowError::ScriptTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            });
        }
        Ok(())
    }
}

/// Raises the stop flag when the waiting future goes away.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Decrements the live-script counter when the interpreter thread is done.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// boa_engine-backed sandbox.
#[derive(Debug, Clone, Default)]
pub struct BoaSandbox {
    config: SandboxConfig,
    active: Arc<AtomicUsize>,
}

impl BoaSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            active: Arc::default(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Interpreter threads that have not yet returned.
    pub fn active_scripts(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn build_source(&self, request: &ScriptRequest) -> Result<String> {
        let allowed = ALLOWED_GLOBALS
            .iter()
            .map(|g| format!("\"{}\"", g))
            .collect::<Vec<_>>()
            .join(",");

        let args_json = serde_json::to_string(&request.args)?;
        // A JSON string literal is a valid JS string literal.
        let args_literal = serde_json::to_string(&args_json)?;

        let locals: String = request
            .args
            .keys()
            .map(|k| format!("var {k} = __args[{}];\n", serde_json::to_string(k).unwrap_or_default()))
            .collect();

        Ok(format!(
            r#"
(function() {{
    var allowed = new Set([{allowed}]);
    var g = globalThis;
    Object.getOwnPropertyNames(g).forEach(function(key) {{
        if (!allowed.has(key)) {{
            try {{ delete g[key]; }} catch (e) {{ g[key] = undefined; }}
        }}
    }});
}})();
var __args = JSON.parse({args_literal});
{locals}
{code}

(function() {{
    if (typeof main !== 'function') {{
        throw new Error('script must define a function named main');
    }}
    return JSON.stringify({{ value: main(__args) }});
}})();
"#,
            code = request.code,
        ))
    }

    fn execute_blocking(
        config: &SandboxConfig,
        source: &str,
        interrupt: &Interrupt,
    ) -> Result<Value> {
        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(config.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(config.recursion_limit);

        let script = Script::parse(Source::from_bytes(source), None, &mut context)
            .map_err(|e| CrewflowError::Script(e.to_string()))?;
        let result = drive(
            script.evaluate_async_with_budget(&mut context, EVAL_BUDGET),
            interrupt,
        )?
        .map_err(|e| CrewflowError::Script(e.to_string()))?;

        let text = result
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| CrewflowError::Script("main() result could not be serialized".into()))?;

        if text.len() > config.max_output_bytes {
            return Err(CrewflowError::Script(format!(
                "output of {} bytes exceeds limit of {}",
                text.len(),
                config.max_output_bytes
            )));
        }

        let wrapper: Value = serde_json::from_str(&text)
            .map_err(|e| CrewflowError::Script(format!("invalid script result: {}", e)))?;
        Ok(wrapper.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Polls the evaluation on the current thread, checking `interrupt` each
/// time the interpreter yields.
fn drive<F: Future>(eval: F, interrupt: &Interrupt) -> Result<F::Output> {
    let mut eval = pin!(eval);
    let mut cx = TaskContext::from_waker(futures::task::noop_waker_ref());
    loop {
        if let Poll::Ready(out) = eval.as_mut().poll(&mut cx) {
            return Ok(out);
        }
        interrupt.check()?;
    }
}

impl ScriptRuntime for BoaSandbox {
    fn run(&self, request: ScriptRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            if request.code.len() > self.config.max_code_bytes {
                return Err(CrewflowError::Script(format!(
                    "code of {} bytes exceeds limit of {}",
                    request.code.len(),
                    self.config.max_code_bytes
                )));
            }

            let source = self.build_source(&request)?;
            let config = self.config.clone();
            let timeout = request.timeout;
            let interrupt = Interrupt {
                deadline: Instant::now().checked_add(timeout),
                timeout,
                stop: Arc::new(AtomicBool::new(false)),
            };
            let _stop = StopOnDrop(interrupt.stop.clone());

            self.active.fetch_add(1, Ordering::SeqCst);
            let active = ActiveGuard(self.active.clone());
            let handle = tokio::task::spawn_blocking(move || {
                let _active = active;
                Self::execute_blocking(&config, &source, &interrupt)
            });

            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(result)) => {
                    debug!(ok = result.is_ok(), "Script finished");
                    result
                }
                Ok(Err(e)) => Err(CrewflowError::Script(format!("script task failed: {}", e))),
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Script timed out");
                    Err(CrewflowError::ScriptTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        })
    }
}
