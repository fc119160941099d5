use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CrewflowError, Result};

/// Top-level Crewflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tenant used when a run does not name one.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    /// Hard ceiling on a whole run, in seconds (0 = unlimited).
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// Credentials inherited by every run (e.g. API tokens referenced by HTTP steps).
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            run_timeout_secs: 0,
            credentials: HashMap::new(),
        }
    }
}

fn default_tenant() -> String { "default".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Per-node override of the run's default model. Unset fields inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverride {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ModelConfig {
    /// Overlay a node-level override on top of this (default) configuration.
    pub fn with_override(&self, over: Option<&ModelOverride>) -> ModelConfig {
        let mut merged = self.clone();
        if let Some(o) = over {
            if let Some(ref p) = o.provider {
                merged.provider = p.clone();
            }
            if let Some(ref m) = o.model_id {
                merged.model_id = m.clone();
            }
            if let Some(t) = o.max_tokens {
                merged.max_tokens = t;
            }
            if let Some(t) = o.temperature {
                merged.temperature = t;
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Limits applied to the script sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Timeout used when a script node does not set its own.
    #[serde(default = "default_script_timeout")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_loop_iteration_limit")]
    pub loop_iteration_limit: u64,
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

fn default_script_timeout() -> u64 { 10_000 }
fn default_max_code_bytes() -> usize { 256 * 1024 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_loop_iteration_limit() -> u64 { 10_000_000 }
fn default_recursion_limit() -> usize { 512 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_script_timeout(),
            max_code_bytes: default_max_code_bytes(),
            max_output_bytes: default_max_output_bytes(),
            loop_iteration_limit: default_loop_iteration_limit(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 { 30_000 }
fn default_user_agent() -> String { "Crewflow/0.3".to_string() }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// HTTP email relay used by notification steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database for knowledge bases and site notices.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.crewflow/crewflow.db".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.crewflow/runs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

/// An agent that delegate steps can forward work to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<ModelOverride>,
}

/// A workflow run on a cron schedule on behalf of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub agent_id: String,
    pub schedule: String,
    pub workflow: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub tenant: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| CrewflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| CrewflowError::Config(e.to_string()))
    }

    /// Resolve the store database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => expand_home("~/.crewflow/runs"),
        })
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
