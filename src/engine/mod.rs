// pubflow engine
// Registry, dispatcher, scheduler and delayed runner behind one facade

//! # Engine Module
//!
//! The engine sits between the domain models and the HTTP server:
//!
//! - `registry`: the static event catalog and config validation
//! - `storage`: the persistence trait and in-memory backend
//! - `stack`: the recursion guard threaded through chained runs
//! - `dispatcher`: executes action instances and their chains
//! - `scheduler`: persists `pubInStageForDuration` runs
//! - `delayed`: claims and executes (or cancels) due scheduled runs
//! - `events`: the best-effort notification channel
//! - `executors`: the seam to whatever actually performs an action
//! - `clock`: the time source for scheduling decisions
//!
//! [`AutomationEngine`] wires these together and adds the operations that
//! span several of them: moving a pub between stages and creating
//! automations.

pub mod clock;
pub mod delayed;
pub mod dispatcher;
pub mod events;
pub mod executors;
pub mod registry;
pub mod scheduler;
pub mod stack;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::models::{
    ActionInstance, ActionInstanceId, ActionRun, ActionRunResult, Automation, AutomationEvent,
    AutomationId, CommunityId, PubId, StageGraph, StageId,
};
use crate::{PubflowError, Result};

use clock::Clock;
use delayed::DelayedRunner;
use dispatcher::{Dispatcher, RunActionInstance};
use events::NotificationChannel;
use executors::ActionExecutor;
use registry::AutomationRegistry;
use scheduler::{ScheduledActionRun, Scheduler};
use stack::RunStack;
use storage::AutomationStorage;

/// Engine tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Longest ancestor stack a chained run may carry
    pub max_stack_depth: usize,
    /// Notification channel capacity per subscriber
    pub notification_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: 10,
            notification_buffer: 1000,
        }
    }
}

/// What happened when a pub moved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveOutcome {
    pub pub_id: PubId,
    pub from: Option<StageId>,
    pub to: StageId,
    /// `pubLeftStage` runs on the old stage
    pub left: Vec<ActionRunResult>,
    /// `pubEnteredStage` runs on the new stage
    pub entered: Vec<ActionRunResult>,
    /// Scheduled runs on the old stage cancelled by the move
    pub cancelled: Vec<ActionRun>,
    /// `pubInStageForDuration` runs scheduled on the new stage
    pub scheduled: Vec<ScheduledActionRun>,
}

#[derive(Clone)]
pub struct AutomationEngine {
    storage: Arc<dyn AutomationStorage>,
    notifications: NotificationChannel,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    delayed: DelayedRunner,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl AutomationEngine {
    pub fn new(
        storage: Arc<dyn AutomationStorage>,
        executor: Arc<dyn ActionExecutor>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let notifications = NotificationChannel::new(config.notification_buffer);
        let dispatcher = Dispatcher::new(
            storage.clone(),
            executor,
            notifications.clone(),
            config.max_stack_depth,
        );
        let scheduler = Scheduler::new(storage.clone(), clock.clone(), notifications.clone());
        let delayed = DelayedRunner::new(
            storage.clone(),
            dispatcher.clone(),
            clock.clone(),
            notifications.clone(),
        );

        Self {
            storage,
            notifications,
            dispatcher,
            scheduler,
            delayed,
            clock,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn AutomationStorage> {
        &self.storage
    }

    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn delayed(&self) -> &DelayedRunner {
        &self.delayed
    }

    pub fn registry(&self) -> &'static AutomationRegistry {
        AutomationRegistry::global()
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub async fn stage_graph(&self, community_id: &CommunityId) -> Result<StageGraph> {
        self.storage.load_stage_graph(community_id).await
    }

    /// Validate and store a new automation
    ///
    /// `source` narrows an `actionSucceeded`/`actionFailed` automation to the
    /// outcome of one instance on the same stage.
    pub async fn create_automation(
        &self,
        event: AutomationEvent,
        action_instance_id: ActionInstanceId,
        raw_config: Option<&Value>,
        source: Option<ActionInstanceId>,
    ) -> Result<Automation> {
        let config = self.registry().validate_config(event, raw_config)?;
        let instance = self.instance(&action_instance_id).await?;

        let mut automation = Automation::new(event, instance.id, config);
        if let Some(source_id) = source {
            if !event.is_chained() {
                return Err(PubflowError::InvalidInput(format!(
                    "'{}' automations cannot name a source action instance",
                    event
                )));
            }
            let source_instance = self.instance(&source_id).await?;
            if source_instance.stage_id != instance.stage_id {
                return Err(PubflowError::InvalidInput(format!(
                    "source action instance {} is not on stage {}",
                    source_id, instance.stage_id
                )));
            }
            automation = automation.watching(source_id);
        }

        let automation = self.storage.create_automation(automation).await?;
        info!(
            automation_id = %automation.id,
            event = %event,
            action_instance = %instance.name,
            stage = %instance.stage_id,
            "🔧 automation created"
        );
        Ok(automation)
    }

    /// An automation and its instance, provided both belong to `community_id`
    pub async fn community_automation(
        &self,
        community_id: &CommunityId,
        automation_id: &AutomationId,
    ) -> Result<(Automation, ActionInstance)> {
        let automation = self
            .storage
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("automation", automation_id))?;
        let instance = self.instance(&automation.action_instance_id).await?;
        if instance.community_id != *community_id {
            return Err(PubflowError::not_found("automation", automation_id));
        }
        Ok((automation, instance))
    }

    /// Run an automation's action instance right now
    pub async fn run_automation(
        &self,
        community_id: &CommunityId,
        automation_id: &AutomationId,
        pub_id: Option<PubId>,
        event: Option<AutomationEvent>,
        stack: RunStack,
    ) -> Result<(Automation, ActionRunResult)> {
        let (automation, instance) = self.community_automation(community_id, automation_id).await?;
        let args = RunActionInstance::new(instance.id, pub_id, event.unwrap_or(automation.event))
            .automation(automation.id)
            .stack(stack);
        let result = self.dispatcher.run_action_instance(args).await?;
        Ok((automation, result))
    }

    /// Run a `webhook` automation with the inbound body as its params
    pub async fn run_webhook(
        &self,
        community_id: &CommunityId,
        automation_id: &AutomationId,
        body: Value,
        stack: RunStack,
    ) -> Result<(Automation, ActionRunResult)> {
        let (automation, instance) = self.community_automation(community_id, automation_id).await?;
        if automation.event != AutomationEvent::Webhook {
            return Err(PubflowError::InvalidInput(format!(
                "automation {} is a '{}' automation, not a webhook",
                automation.id, automation.event
            )));
        }
        let args = RunActionInstance::new(instance.id, None, AutomationEvent::Webhook)
            .automation(automation.id)
            .stack(stack)
            .params(body);
        let result = self.dispatcher.run_action_instance(args).await?;
        Ok((automation, result))
    }

    /// Move a pub to `to`, firing the exit, entry and duration automations
    ///
    /// A pub without a stage may be placed on any stage of its community.
    /// Otherwise the move must follow a move constraint. Scheduled runs on
    /// the old stage are cancelled before the new stage schedules its own.
    pub async fn move_pub(&self, pub_id: &PubId, to: &StageId) -> Result<MoveOutcome> {
        let pub_item = self
            .storage
            .get_pub(pub_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("pub", pub_id))?;
        let graph = self.stage_graph(&pub_item.community_id).await?;
        if !graph.contains(to) {
            return Err(PubflowError::not_found("stage", to));
        }

        let current = self.storage.get_pub_stage(pub_id).await?;
        if let Some(from) = &current {
            if !graph.is_legal_move(from, to) {
                return Err(PubflowError::NotFound(format!(
                    "move constraint {} -> {}",
                    from, to
                )));
            }
        }

        let from = self.storage.set_pub_stage(pub_id, to.clone()).await?;
        info!(pub_id = %pub_id, from = ?from, to = %to, "📦 pub moved");

        let cancelled = match &from {
            Some(stage) => self.delayed.cancel_on_stage_exit(pub_id, stage).await?,
            None => Vec::new(),
        };

        let left = match &from {
            Some(stage) => {
                self.dispatcher
                    .run_instances_for_event(
                        Some(*pub_id),
                        stage,
                        AutomationEvent::PubLeftStage,
                        Value::Null,
                    )
                    .await?
            }
            None => Vec::new(),
        };
        let entered = self
            .dispatcher
            .run_instances_for_event(
                Some(*pub_id),
                to,
                AutomationEvent::PubEnteredStage,
                Value::Null,
            )
            .await?;
        let scheduled = self.scheduler.schedule_action_instances(*pub_id, to).await?;

        Ok(MoveOutcome {
            pub_id: *pub_id,
            from,
            to: to.clone(),
            left,
            entered,
            cancelled,
            scheduled,
        })
    }

    async fn instance(&self, id: &ActionInstanceId) -> Result<ActionInstance> {
        self.storage
            .get_action_instance(id)
            .await?
            .ok_or_else(|| PubflowError::not_found("action instance", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::Fixture;
    use crate::models::ConfigError;
    use serde_json::json;

    #[tokio::test]
    async fn test_move_pub_fires_exit_entry_and_schedule() {
        let fx = Fixture::journal().await;
        let exit = fx.instance("Exit", "log", "submitted").await;
        let entry = fx.instance("Entry", "log", "under-evaluation").await;
        let reminder = fx.instance("Reminder", "email", "under-evaluation").await;
        fx.automate(AutomationEvent::PubLeftStage, exit.id).await;
        fx.automate(AutomationEvent::PubEnteredStage, entry.id).await;
        fx.automate_with(
            AutomationEvent::PubInStageForDuration,
            reminder.id,
            json!({ "duration": 2, "interval": "week" }),
        )
        .await;
        let pub_id = fx.pub_in("submitted").await;

        let outcome = fx
            .engine
            .move_pub(&pub_id, &"under-evaluation".into())
            .await
            .unwrap();

        assert_eq!(outcome.from, Some(StageId::from("submitted")));
        assert_eq!(outcome.left.len(), 1);
        assert_eq!(outcome.left[0].action_instance_id, exit.id);
        assert_eq!(outcome.entered.len(), 1);
        assert_eq!(outcome.entered[0].action_instance_id, entry.id);
        assert_eq!(outcome.scheduled.len(), 1);
        assert_eq!(
            fx.storage.get_pub_stage(&pub_id).await.unwrap(),
            Some(StageId::from("under-evaluation"))
        );
    }

    #[tokio::test]
    async fn test_reentering_stage_reschedules_from_new_entry() {
        let fx = Fixture::journal().await;
        let email = fx.instance("Remind reviewers", "email", "under-evaluation").await;
        fx.automate_with(
            AutomationEvent::PubInStageForDuration,
            email.id,
            json!({ "duration": 3, "interval": "day" }),
        )
        .await;
        let pub_id = fx.pub_in("submitted").await;

        let first = fx
            .engine
            .move_pub(&pub_id, &"under-evaluation".into())
            .await
            .unwrap();
        let first_run = first.scheduled[0].action_run_id;

        fx.clock.advance(chrono::Duration::days(1));
        let left = fx.engine.move_pub(&pub_id, &"rejected".into()).await.unwrap();
        assert_eq!(left.cancelled.len(), 1);
        assert_eq!(left.cancelled[0].id, first_run);
        fx.engine.move_pub(&pub_id, &"submitted".into()).await.unwrap();

        fx.clock.advance(chrono::Duration::days(1));
        let reentered_at = fx.clock.now();
        let again = fx
            .engine
            .move_pub(&pub_id, &"under-evaluation".into())
            .await
            .unwrap();
        assert_eq!(again.scheduled.len(), 1);
        assert_ne!(again.scheduled[0].action_run_id, first_run);
        assert_eq!(again.scheduled[0].run_at, reentered_at + chrono::Duration::days(3));

        // the first entry's deadline passes without firing anything
        fx.clock.advance(chrono::Duration::days(1));
        assert!(fx.engine.delayed().run_due(&fx.community).await.unwrap().is_empty());
        assert!(fx.executor.calls_for("email").is_empty());

        fx.clock.advance(chrono::Duration::days(2));
        let due = fx.engine.delayed().run_due(&fx.community).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].succeeded());
        assert_eq!(fx.executor.calls_for("email").len(), 1);

        let first = fx.storage.get_action_run(&first_run).await.unwrap().unwrap();
        assert_eq!(first.status, crate::models::ActionRunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_illegal_move_is_not_found_and_changes_nothing() {
        let fx = Fixture::journal().await;
        let pub_id = fx.pub_in("submitted").await;

        let err = fx.engine.move_pub(&pub_id, &"accepted".into()).await.unwrap_err();
        assert!(matches!(err, PubflowError::NotFound(_)));
        assert_eq!(
            fx.storage.get_pub_stage(&pub_id).await.unwrap(),
            Some(StageId::from("submitted"))
        );

        let err = fx.engine.move_pub(&pub_id, &"nowhere".into()).await.unwrap_err();
        assert!(matches!(err, PubflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unplaced_pub_may_enter_any_stage() {
        let fx = Fixture::journal().await;
        let pub_id = fx.unplaced_pub().await;
        let outcome = fx.engine.move_pub(&pub_id, &"accepted".into()).await.unwrap();
        assert_eq!(outcome.from, None);
        assert!(outcome.left.is_empty());
    }

    #[tokio::test]
    async fn test_create_automation_validates_config() {
        let fx = Fixture::journal().await;
        let instance = fx.instance("A", "log", "submitted").await;

        let err = fx
            .engine
            .create_automation(
                AutomationEvent::PubInStageForDuration,
                instance.id,
                Some(&json!({ "duration": 0, "interval": "day" })),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::Config(ConfigError::InvalidDuration(_))));

        let err = fx
            .engine
            .create_automation(AutomationEvent::PubEnteredStage, instance.id, None, Some(instance.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::InvalidInput(_)));

        let elsewhere = fx.instance("B", "log", "accepted").await;
        let err = fx
            .engine
            .create_automation(AutomationEvent::ActionSucceeded, instance.id, None, Some(elsewhere.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::InvalidInput(_)));

        assert!(fx
            .storage
            .list_automations(&"submitted".into(), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_webhook_requires_webhook_automation() {
        let fx = Fixture::journal().await;
        let instance = fx.instance("Hook", "log", "submitted").await;
        let hook = fx.automate(AutomationEvent::Webhook, instance.id).await;
        let entered = fx.automate(AutomationEvent::PubEnteredStage, instance.id).await;

        let (_, result) = fx
            .engine
            .run_webhook(&fx.community, &hook.id, json!({ "doi": "10.1/x" }), RunStack::new())
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(fx.executor.calls()[0].params["doi"], "10.1/x");

        let err = fx
            .engine
            .run_webhook(&fx.community, &entered.id, json!({}), RunStack::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::InvalidInput(_)));

        let err = fx
            .engine
            .run_webhook(&"other".into(), &hook.id, json!({}), RunStack::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::NotFound(_)));
    }
}
