use std::io::Write;

use crewflow_core::config::AppConfig;
use crewflow_core::error::CrewflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
default_tenant = "acme"
run_timeout_secs = 300

[engine.credentials]
crm_token = "tok-123"

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 2

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o"

[sandbox]
default_timeout_ms = 2000
loop_iteration_limit = 5000

[http]
default_timeout_ms = 5000

[email]
endpoint = "https://mail.example.com/send"
api_key = "mk-1"
from = "crewflow@example.com"

[store]
path = "/tmp/crewflow-test.db"

[log]
log_dir = "/tmp/crewflow-runs"

[[agents]]
id = "legal"
name = "Legal reviewer"
system_prompt = "You review contracts."

[agents.model]
modelId = "claude-haiku"
maxTokens = 512

[[triggers]]
agent_id = "legal"
schedule = "0 0 9 * * Mon-Fri *"
workflow = "~/workflows/review.json"
input = "daily review"
tenant = "acme-legal"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_tenant, "acme");
    assert_eq!(config.engine.run_timeout_secs, 300);
    assert_eq!(config.engine.credentials["crm_token"], "tok-123");

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    let retry = config.model.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.initial_backoff_ms, 1000);
    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o");

    assert_eq!(config.sandbox.default_timeout_ms, 2000);
    assert_eq!(config.sandbox.loop_iteration_limit, 5000);
    assert_eq!(config.http.default_timeout_ms, 5000);

    let email = config.email.as_ref().expect("email present");
    assert_eq!(email.from, "crewflow@example.com");

    assert_eq!(
        config.log_dir().as_deref(),
        Some(std::path::Path::new("/tmp/crewflow-runs"))
    );

    let agent = &config.agents[0];
    assert_eq!(agent.id, "legal");
    let over = agent.model.as_ref().expect("agent model override");
    assert_eq!(over.model_id.as_deref(), Some("claude-haiku"));
    assert_eq!(over.max_tokens, Some(512));

    let trigger = &config.triggers[0];
    assert_eq!(trigger.schedule, "0 0 9 * * Mon-Fri *");
    assert_eq!(trigger.tenant.as_deref(), Some("acme-legal"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("CREWFLOW_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${CREWFLOW_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("CREWFLOW_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.default_tenant, "default");
    assert_eq!(config.engine.run_timeout_secs, 0);
    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.sandbox.default_timeout_ms, 10_000);
    assert_eq!(config.http.default_timeout_ms, 30_000);
    assert!(config.fallback_models.is_empty());
    assert!(config.email.is_none());
    assert!(config.log.is_none());
    assert!(config.log_dir().is_none());
    assert!(config.agents.is_empty());
    assert!(config.triggers.is_empty());
    assert!(config.store_path().ends_with("crewflow.db"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/crewflow.toml")).unwrap_err();
    assert!(matches!(err, CrewflowError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[model\nmodel_id = ").expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, CrewflowError::Config(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let toml_content = r#"
[model]
model_id = "gpt-4o"

[[triggers]]
agent_id = "ops"
schedule = "0 */5 * * * * *"
workflow = "ops.json"
"#;
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    let config = AppConfig::load(tmp.path()).expect("load config");

    let printed = toml::to_string_pretty(&config).expect("serialize");
    let reparsed: AppConfig = toml::from_str(&printed).expect("reparse");
    assert_eq!(reparsed.model, config.model);
    assert_eq!(reparsed.triggers[0].agent_id, "ops");
    assert_eq!(reparsed.triggers[0].input, "");
}
