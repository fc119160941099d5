use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crewflow_core::error::{CrewflowError, Result};
use crewflow_core::event::EventBus;
use crewflow_core::types::{RunId, WorkflowEvent};

use crate::definition::WorkflowDefinition;
use crate::engine::{RunOptions, WorkflowEngine};

struct ScheduledTrigger {
    expression: String,
    schedule: Schedule,
    definition: Arc<WorkflowDefinition>,
    input: String,
    options: RunOptions,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

/// A registered trigger as reported by [`TriggerRegistry::registered`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTrigger {
    pub agent_id: String,
    pub schedule: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Cron-scheduled workflow runs, one per agent.
///
/// Each started trigger owns a task and a child of the registry's
/// cancellation token. Registering an agent again replaces its trigger.
pub struct TriggerRegistry {
    engine: Arc<WorkflowEngine>,
    event_bus: Option<Arc<EventBus>>,
    base: RunOptions,
    cancel: CancellationToken,
    triggers: BTreeMap<String, ScheduledTrigger>,
    started: bool,
}

impl TriggerRegistry {
    /// `base` supplies the tenant and run defaults for every fired run.
    pub fn new(engine: Arc<WorkflowEngine>, base: RunOptions) -> Self {
        Self {
            engine,
            event_bus: None,
            base,
            cancel: CancellationToken::new(),
            triggers: BTreeMap::new(),
            started: false,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn register(
        &mut self,
        agent_id: &str,
        cron_expr: &str,
        definition: WorkflowDefinition,
        input: &str,
    ) -> Result<()> {
        self.register_for_tenant(agent_id, cron_expr, definition, input, None)
    }

    /// Register with a tenant other than the registry default.
    pub fn register_for_tenant(
        &mut self,
        agent_id: &str,
        cron_expr: &str,
        definition: WorkflowDefinition,
        input: &str,
        tenant_id: Option<&str>,
    ) -> Result<()> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| {
            CrewflowError::Config(format!(
                "invalid schedule '{}' for agent {}: {}",
                cron_expr, agent_id, e
            ))
        })?;
        self.engine.compile(&definition)?;

        let mut options = self.base.clone();
        if let Some(tenant) = tenant_id {
            options.tenant_id = tenant.to_string();
        }

        self.unregister(agent_id);
        let mut trigger = ScheduledTrigger {
            expression: cron_expr.to_string(),
            schedule,
            definition: Arc::new(definition),
            input: input.to_string(),
            options,
            task: None,
        };
        if self.started {
            trigger.task = Some(self.spawn(agent_id, &trigger));
        }
        info!(agent_id, schedule = cron_expr, "Trigger registered");
        self.triggers.insert(agent_id.to_string(), trigger);
        Ok(())
    }

    /// Remove an agent's trigger, stopping its task. Returns whether one existed.
    pub fn unregister(&mut self, agent_id: &str) -> bool {
        match self.triggers.remove(agent_id) {
            Some(trigger) => {
                if let Some((token, _)) = trigger.task {
                    token.cancel();
                }
                info!(agent_id, "Trigger unregistered");
                true
            }
            None => false,
        }
    }

    /// Start every registered trigger. Triggers registered later start immediately.
    pub fn start(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.started = true;

        let pending: Vec<String> = self
            .triggers
            .iter()
            .filter(|(_, t)| t.task.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in pending {
            if let Some(trigger) = self.triggers.get(&agent_id) {
                let task = self.spawn(&agent_id, trigger);
                if let Some(trigger) = self.triggers.get_mut(&agent_id) {
                    trigger.task = Some(task);
                }
            }
        }
        info!(count = self.triggers.len(), "Trigger registry started");
    }

    /// Cancel every trigger task and wait for them to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.started = false;
        for (agent_id, trigger) in self.triggers.iter_mut() {
            if let Some((_, handle)) = trigger.task.take() {
                if let Err(e) = handle.await {
                    warn!(agent_id = %agent_id, error = %e, "Trigger task ended abnormally");
                }
            }
        }
        info!("Trigger registry stopped");
    }

    pub fn registered(&self) -> Vec<RegisteredTrigger> {
        self.triggers
            .iter()
            .map(|(agent_id, t)| RegisteredTrigger {
                agent_id: agent_id.clone(),
                schedule: t.expression.clone(),
                next_fire: t.schedule.upcoming(Utc).next(),
                running: t.task.is_some(),
            })
            .collect()
    }

    fn spawn(
        &self,
        agent_id: &str,
        trigger: &ScheduledTrigger,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = self.cancel.child_token();
        let handle = tokio::spawn(fire_loop(
            Arc::clone(&self.engine),
            self.event_bus.clone(),
            agent_id.to_string(),
            trigger.schedule.clone(),
            Arc::clone(&trigger.definition),
            trigger.input.clone(),
            trigger.options.clone(),
            token.clone(),
        ));
        (token, handle)
    }
}

#[allow(clippy::too_many_arguments)]
async fn fire_loop(
    engine: Arc<WorkflowEngine>,
    event_bus: Option<Arc<EventBus>>,
    agent_id: String,
    schedule: Schedule,
    definition: Arc<WorkflowDefinition>,
    input: String,
    options: RunOptions,
    cancel: CancellationToken,
) {
    loop {
        let Some(fire_at) = schedule.upcoming(Utc).next() else {
            info!(agent_id = %agent_id, "Schedule has no upcoming times, trigger idle");
            cancel.cancelled().await;
            return;
        };
        let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }

        let run_id = RunId::new();
        info!(agent_id = %agent_id, run_id = %run_id, "Firing trigger");
        if let Some(ref bus) = event_bus {
            bus.publish(WorkflowEvent::TriggerFired {
                agent_id: agent_id.clone(),
                run_id: run_id.clone(),
            });
        }

        let run = options
            .clone()
            .with_cancel(cancel.child_token())
            .with_run_id(run_id.clone());
        match engine.execute(&definition, &input, run, None).await {
            Ok(result) if result.success => {
                info!(agent_id = %agent_id, run_id = %run_id, "Triggered run completed")
            }
            Ok(result) => warn!(
                agent_id = %agent_id,
                run_id = %run_id,
                error = result.error.as_deref().unwrap_or(""),
                "Triggered run failed"
            ),
            Err(e) => error!(agent_id = %agent_id, error = %e, "Triggered workflow is invalid"),
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Services;
    use crewflow_core::traits::ModelClient;
    use crewflow_core::types::RunDefaults;
    use crewflow_test_utils::{test_model_config, MockModelClient, WorkflowJson};
    use serde_json::json;

    fn registry() -> (TriggerRegistry, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let services = Services::new(Arc::new(MockModelClient::new()) as Arc<dyn ModelClient>);
        let engine = Arc::new(WorkflowEngine::new(services).with_event_bus(bus.clone()));
        let base = RunOptions::new("acme", RunDefaults::new(test_model_config()));
        (TriggerRegistry::new(engine, base).with_event_bus(bus.clone()), bus)
    }

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition::from_value(
            WorkflowJson::new()
                .node("start", "trigger", json!({}))
                .node("end", "output", json!({}))
                .edge("start", "end")
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_register_rejects_bad_schedule() {
        let (mut reg, _) = registry();
        let err = reg.register("a", "not a cron", workflow(), "").unwrap_err();
        assert!(matches!(err, CrewflowError::Config(_)));
        assert!(reg.registered().is_empty());
    }

    #[test]
    fn test_register_rejects_invalid_workflow() {
        let (mut reg, _) = registry();
        let cyclic = WorkflowDefinition::from_value(
            WorkflowJson::new()
                .node("a", "output", json!({}))
                .node("b", "output", json!({}))
                .edge("a", "b")
                .edge("b", "a")
                .build(),
        )
        .unwrap();
        let err = reg.register("a", "0 0 9 * * *", cyclic, "").unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_register_replace_and_unregister() {
        let (mut reg, _) = registry();
        reg.register("ops", "0 0 9 * * *", workflow(), "daily").unwrap();
        reg.register("ops", "0 30 9 * * *", workflow(), "daily").unwrap();
        reg.register("sales", "0 0 12 * * Mon", workflow(), "weekly").unwrap();

        let listed = reg.registered();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].agent_id, "ops");
        assert_eq!(listed[0].schedule, "0 30 9 * * *");
        assert!(listed[0].next_fire.is_some());
        assert!(!listed[0].running);

        assert!(reg.unregister("ops"));
        assert!(!reg.unregister("ops"));
        assert_eq!(reg.registered().len(), 1);
    }

    #[tokio::test]
    async fn test_started_trigger_fires_run() {
        let (mut reg, bus) = registry();
        let mut rx = bus.subscribe();
        reg.register("ticker", "* * * * * *", workflow(), "tick").unwrap();
        reg.start();
        assert!(reg.registered()[0].running);

        let fired = tokio::time::timeout(Duration::from_secs(3), async {
            let mut fired_run = None;
            loop {
                match rx.recv().await {
                    Ok(WorkflowEvent::TriggerFired { agent_id, run_id }) => {
                        assert_eq!(agent_id, "ticker");
                        fired_run = Some(run_id);
                    }
                    Ok(WorkflowEvent::RunFinished { run_id, success, .. })
                        if Some(&run_id) == fired_run.as_ref() =>
                    {
                        return success;
                    }
                    Ok(_) => {}
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert!(fired);

        reg.stop().await;
        assert!(!reg.registered()[0].running);
    }
}
