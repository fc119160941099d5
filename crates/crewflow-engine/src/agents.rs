use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crewflow_core::config::{AgentProfile, ModelConfig};
use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::traits::{AgentDelegate, ModelClient};
use crewflow_core::types::{ChatMessage, CompletionRequest};

/// Answers delegated messages by prompting the model as the named agent.
pub struct ModelDelegate {
    model: Arc<dyn ModelClient>,
    default_model: ModelConfig,
    agents: HashMap<String, AgentProfile>,
}

impl ModelDelegate {
    pub fn new(model: Arc<dyn ModelClient>, default_model: ModelConfig) -> Self {
        Self {
            model,
            default_model,
            agents: HashMap::new(),
        }
    }

    pub fn with_agents(mut self, profiles: impl IntoIterator<Item = AgentProfile>) -> Self {
        for profile in profiles {
            self.agents.insert(profile.id.clone(), profile);
        }
        self
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl AgentDelegate for ModelDelegate {
    fn ask(
        &self,
        tenant_id: &str,
        agent_id: &str,
        message: String,
    ) -> BoxFuture<'_, Result<String>> {
        let profile = self.agents.get(agent_id).cloned();
        let agent = agent_id.to_string();
        let tenant = tenant_id.to_string();
        Box::pin(async move {
            let profile = profile.ok_or_else(|| CrewflowError::Delegate {
                agent: agent.clone(),
                message: "unknown agent".into(),
            })?;
            let model = self.default_model.with_override(profile.model.as_ref());

            let name = profile.name.as_deref().unwrap_or(&profile.id);
            let system = match profile.system_prompt {
                Some(ref prompt) => prompt.clone(),
                None => format!("You are {}, an assistant agent.", name),
            };

            debug!(tenant_id = %tenant, agent_id = %agent, model = %model.model_id, "Delegating message");
            let completion = self
                .model
                .complete(
                    &model,
                    CompletionRequest::new(vec![
                        ChatMessage::system(system),
                        ChatMessage::user(message),
                    ]),
                )
                .await
                .map_err(|e| CrewflowError::Delegate {
                    agent: agent.clone(),
                    message: e.to_string(),
                })?;
            Ok(completion.text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crewflow_test_utils::{test_model_config, MockModelClient};

    fn profile(id: &str, prompt: Option<&str>) -> AgentProfile {
        AgentProfile {
            id: id.into(),
            name: Some(format!("{} agent", id)),
            system_prompt: prompt.map(str::to_string),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_answers_with_agent_prompt() {
        let client = MockModelClient::new().with_response("Looks fine.");
        let requests = client.requests();
        let delegate = ModelDelegate::new(Arc::new(client), test_model_config())
            .with_agents([profile("legal", Some("You review contracts."))]);

        let reply = delegate
            .ask("acme", "legal", "Check clause 4".into())
            .await
            .unwrap();
        assert_eq!(reply, "Looks fine.");
        let sent = requests.lock().unwrap();
        assert_eq!(sent[0].messages[0].content, "You review contracts.");
        assert_eq!(sent[0].messages[1].content, "Check clause 4");
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let delegate = ModelDelegate::new(Arc::new(MockModelClient::new()), test_model_config())
            .with_agents([profile("legal", None)]);
        let err = delegate.ask("acme", "finance", "hi".into()).await.unwrap_err();
        assert!(matches!(err, CrewflowError::Delegate { ref agent, .. } if agent == "finance"));
        assert_eq!(delegate.agent_ids(), vec!["legal"]);
    }
}
