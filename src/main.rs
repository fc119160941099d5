use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crewflow_core::config::{AppConfig, ModelConfig, RetryConfig};
use crewflow_core::event::EventBus;
use crewflow_core::traits::ModelClient;
use crewflow_core::types::{NodeStatus, ProgressEvent, RunDefaults};

use crewflow_channels::HttpMailer;
use crewflow_engine::{
    ModelDelegate, ProgressCallback, RunLogger, RunOptions, Services, TriggerRegistry,
    WorkflowDefinition, WorkflowEngine, WorkflowExecutionResult,
};
use crewflow_store::{SqliteKnowledgeBase, SqliteNoticeBoard};

#[derive(Parser)]
#[command(name = "crewflow", version, about = "Workflow orchestration for AI agent teams")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "crewflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow once and print its result
    Run {
        /// Workflow definition (JSON)
        workflow: PathBuf,
        /// Trigger input; read from stdin when omitted
        #[arg(short, long)]
        input: Option<String>,
        /// Tenant to run as (defaults to engine.default_tenant)
        #[arg(short, long)]
        tenant: Option<String>,
        /// Write a JSONL run log into this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow definition and print its execution layers
    Validate {
        /// Workflow definition (JSON)
        workflow: PathBuf,
    },
    /// Run the configured cron triggers until Ctrl-C
    Schedule,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crewflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "crewflow", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Validate { workflow } => {
            let definition = WorkflowDefinition::load(&workflow)
                .with_context(|| format!("failed to read {}", workflow.display()))?;
            let engine = WorkflowEngine::new(build_services(&config)?);
            let graph = engine.compile(&definition)?;
            println!(
                "{}: {} nodes, {} layers",
                workflow.display(),
                graph.len(),
                graph.layers().len()
            );
            for (i, layer) in graph.layer_ids().iter().enumerate() {
                println!("  layer {}: {}", i, layer.join(", "));
            }
        }
        Commands::Run {
            workflow,
            input,
            tenant,
            log_dir,
            json,
        } => {
            let definition = WorkflowDefinition::load(&workflow)
                .with_context(|| format!("failed to read {}", workflow.display()))?;
            let input = match input {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf.trim_end().to_string()
                }
            };

            let event_bus = Arc::new(EventBus::default());
            let engine = build_engine(&config, event_bus.clone())?;

            let cancel = CancellationToken::new();
            let logger_cancel = CancellationToken::new();
            let logger = log_dir
                .or_else(|| config.log_dir())
                .map(|dir| RunLogger::new(dir).spawn(&event_bus, logger_cancel.clone()));

            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!("Interrupted, aborting run");
                ctrl_c.cancel();
            });

            let tenant = tenant.unwrap_or_else(|| config.engine.default_tenant.clone());
            let options = RunOptions::new(tenant, run_defaults(&config)).with_cancel(cancel);
            let progress: Option<ProgressCallback> = if json {
                None
            } else {
                Some(Arc::new(print_progress))
            };

            let result = engine.execute(&definition, &input, options, progress).await?;

            logger_cancel.cancel();
            if let Some(handle) = logger {
                handle.await.ok();
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            if config.triggers.is_empty() {
                anyhow::bail!("no [[triggers]] configured in {}", cli.config.display());
            }

            let event_bus = Arc::new(EventBus::default());
            let engine = Arc::new(build_engine(&config, event_bus.clone())?);
            let cancel = CancellationToken::new();

            let logger = config
                .log_dir()
                .map(|dir| RunLogger::new(dir).spawn(&event_bus, cancel.clone()));

            let base = RunOptions::new(config.engine.default_tenant.clone(), run_defaults(&config));
            let mut registry = TriggerRegistry::new(engine, base).with_event_bus(event_bus);
            for trigger in &config.triggers {
                let path = crewflow_core::config::expand_home(&trigger.workflow);
                let definition = match WorkflowDefinition::load(&path) {
                    Ok(d) => d,
                    Err(e) => {
                        error!(agent_id = %trigger.agent_id, path = %path.display(), error = %e, "Skipping trigger");
                        continue;
                    }
                };
                if let Err(e) = registry.register_for_tenant(
                    &trigger.agent_id,
                    &trigger.schedule,
                    definition,
                    &trigger.input,
                    trigger.tenant.as_deref(),
                ) {
                    error!(agent_id = %trigger.agent_id, error = %e, "Skipping trigger");
                }
            }

            for t in registry.registered() {
                let next = t
                    .next_fire
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<20} {:<24} next: {}", t.agent_id, t.schedule, next);
            }

            registry.start();
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down scheduler...");
            registry.stop().await;
            cancel.cancel();
            if let Some(handle) = logger {
                handle.await.ok();
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".crewflow").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    eprintln!("Warning: No config file found. Set ANTHROPIC_API_KEY or create crewflow.toml");
    create_env_config()
}

/// Model client with retries and fallbacks when configured.
fn build_model_client(config: &AppConfig) -> Arc<dyn ModelClient> {
    let primary = crewflow_llm::create_client(&config.model);
    if config.fallback_models.is_empty() && config.model.retry.is_none() {
        return Arc::from(primary);
    }
    let retry = config.model.retry.clone().unwrap_or_else(RetryConfig::default);
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|mc| (mc.clone(), crewflow_llm::create_client(mc)))
        .collect();
    Arc::new(crewflow_llm::RetryingClient::new(primary, fallbacks, retry))
}

fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let model = build_model_client(config);
    let db_path = config.store_path();
    let knowledge = SqliteKnowledgeBase::open(&db_path)
        .with_context(|| format!("failed to open knowledge base at {}", db_path.display()))?;
    let notices = SqliteNoticeBoard::open(&db_path)?;
    let delegate = ModelDelegate::new(model.clone(), config.model.clone())
        .with_agents(config.agents.iter().cloned());

    let mut services = Services::new(model)
        .with_knowledge_base(Arc::new(knowledge))
        .with_notifier(Arc::new(notices))
        .with_delegate(Arc::new(delegate))
        .with_sandbox(config.sandbox.clone())
        .with_http(&config.http);
    if let Some(ref email) = config.email {
        services = services.with_mailer(Arc::new(HttpMailer::new(email.clone())));
    }
    Ok(services)
}

fn build_engine(config: &AppConfig, event_bus: Arc<EventBus>) -> anyhow::Result<WorkflowEngine> {
    let mut engine = WorkflowEngine::new(build_services(config)?).with_event_bus(event_bus);
    if config.engine.run_timeout_secs > 0 {
        engine = engine.with_run_timeout(Duration::from_secs(config.engine.run_timeout_secs));
    }
    Ok(engine)
}

fn run_defaults(config: &AppConfig) -> RunDefaults {
    RunDefaults::new(config.model.clone()).with_credentials(config.engine.credentials.clone())
}

fn print_progress(event: ProgressEvent) {
    match event.status {
        NodeStatus::Running => eprintln!("[{}] running", event.node_id),
        NodeStatus::Completed => eprintln!("[{}] completed", event.node_id),
        NodeStatus::Skipped => eprintln!("[{}] skipped", event.node_id),
        NodeStatus::Failed => eprintln!(
            "[{}] failed: {}",
            event.node_id,
            event.error.as_deref().unwrap_or("unknown error")
        ),
        NodeStatus::Pending => {}
    }
}

fn print_summary(result: &WorkflowExecutionResult) {
    for r in &result.node_results {
        let attempts = if r.attempts > 1 {
            format!(" ({} attempts)", r.attempts)
        } else {
            String::new()
        };
        eprintln!(
            "  {:<20} {:<10} {:>6}ms{}",
            r.node_id,
            r.status.to_string(),
            r.duration_ms,
            attempts
        );
    }
    match result.error {
        Some(ref e) => eprintln!(
            "Run {} failed after {}ms: {}",
            result.run_id, result.total_duration_ms, e
        ),
        None => eprintln!(
            "Run {} completed in {}ms",
            result.run_id, result.total_duration_ms
        ),
    }
    match result.final_output {
        serde_json::Value::String(ref s) => println!("{}", s),
        serde_json::Value::Null => {}
        ref other => println!("{}", serde_json::to_string_pretty(other).unwrap_or_default()),
    }
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let anthropic_key = std::env::var("ANTHROPIC_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let (provider, model_id, api_key, base_url) = if let Some(key) = anthropic_key {
        ("anthropic", "claude-sonnet-4-20250514", Some(key), None)
    } else if let Some(key) = openai_key {
        ("openai", "gpt-4o", Some(key), None)
    } else {
        // Default to Ollama (local)
        (
            "ollama",
            "llama3.2",
            None,
            Some("http://localhost:11434/v1/chat/completions".to_string()),
        )
    };

    Ok(AppConfig {
        engine: Default::default(),
        model: ModelConfig {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            api_key,
            base_url,
            max_tokens: 4096,
            temperature: 0.0,
            retry: None,
        },
        fallback_models: Vec::new(),
        sandbox: Default::default(),
        http: Default::default(),
        email: None,
        store: Default::default(),
        log: None,
        agents: Vec::new(),
        triggers: Vec::new(),
    })
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
