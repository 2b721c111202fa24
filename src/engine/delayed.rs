// Delayed runner - executes or cancels due scheduled runs

//! # Delayed Runner
//!
//! Invoked by an external, at-least-once trigger once a scheduled run is
//! due. For each delivery it:
//!
//! 1. returns the recorded outcome if the run has left `scheduled` already
//! 2. cancels the run if the pub no longer sits in the instance's stage
//! 3. otherwise claims it (`scheduled` -> `running`) and hands it to the
//!    dispatcher, using the run's own persisted stack
//!
//! Steps 2 and 3 are compare-and-set writes. A concurrent delivery or a
//! concurrent cancel that wins the race makes this call a no-op.
//!
//! Moving a pub off a stage cancels its pending runs there eagerly
//! ([`DelayedRunner::cancel_on_stage_exit`]), so re-entering the stage
//! always schedules from the new entry time. Step 2 still covers runs that
//! come due while a move is in flight.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::dispatcher::Dispatcher;
use super::events::NotificationChannel;
use super::storage::{AutomationStorage, RunFilter};
use crate::models::{
    ActionRun, ActionRunId, ActionRunResult, ActionRunStatus, CommunityId, PubId, StageId,
};
use crate::{PubflowError, Result};

#[derive(Clone)]
pub struct DelayedRunner {
    storage: Arc<dyn AutomationStorage>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    notifications: NotificationChannel,
}

impl DelayedRunner {
    pub fn new(
        storage: Arc<dyn AutomationStorage>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        notifications: NotificationChannel,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            clock,
            notifications,
        }
    }

    /// Execute a due scheduled run
    ///
    /// `config_override` replaces the override stored on the run, if given.
    pub async fn run_delayed_automation(
        &self,
        action_run_id: &ActionRunId,
        config_override: Option<Value>,
    ) -> Result<ActionRunResult> {
        let run = self.load(action_run_id).await?;
        if run.status != ActionRunStatus::Scheduled {
            debug!(action_run_id = %run.id, status = %run.status, "delayed run already handled");
            return Ok(ActionRunResult::from_run(&run));
        }

        let now = self.clock.now();
        if !run.is_due(now) {
            return Err(PubflowError::InvalidState(format!(
                "action run {} is not due until {}",
                run.id,
                run.run_at.map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
            )));
        }

        let instance = match self.storage.get_action_instance(&run.action_instance_id).await? {
            Some(instance) => instance,
            None => {
                return self
                    .cancel_if_scheduled(run, "action instance no longer exists")
                    .await
            }
        };

        let current_stage = match run.pub_id {
            Some(pub_id) => self.storage.get_pub_stage(&pub_id).await?,
            None => None,
        };
        if current_stage.as_ref() != Some(&instance.stage_id) {
            info!(
                action_run_id = %run.id,
                stage = %instance.stage_id,
                current = ?current_stage,
                "🚫 pub left the stage, cancelling scheduled run"
            );
            return self
                .cancel_if_scheduled(run, format!("pub is no longer in stage {}", instance.stage_id))
                .await;
        }

        let mut claimed = run.clone();
        claimed.status = ActionRunStatus::Running;
        claimed.updated_at = now;
        if config_override.is_some() {
            claimed.config_override = config_override;
        }

        if !self
            .storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, claimed.clone())
            .await?
        {
            debug!(action_run_id = %run.id, "lost claim on scheduled run");
            return self.recorded(action_run_id).await;
        }

        self.notifications.publish(&claimed);
        info!(action_run_id = %claimed.id, action_instance = %instance.name, "⏱️ running delayed automation");
        self.dispatcher.execute_claimed(claimed, instance).await
    }

    /// Cancel a scheduled run
    ///
    /// Fails with `InvalidState` once the run is running or finished.
    pub async fn cancel_scheduled_automation(&self, action_run_id: &ActionRunId) -> Result<ActionRun> {
        let run = self.load(action_run_id).await?;
        if run.status != ActionRunStatus::Scheduled {
            return Err(PubflowError::InvalidState(format!(
                "action run {} is {}, not scheduled",
                run.id, run.status
            )));
        }

        let mut cancelled = run;
        cancelled.cancel("cancelled on request");
        if !self
            .storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, cancelled.clone())
            .await?
        {
            let current = self.load(action_run_id).await?;
            return Err(PubflowError::InvalidState(format!(
                "action run {} is {}, not scheduled",
                current.id, current.status
            )));
        }

        self.notifications.publish(&cancelled);
        info!(action_run_id = %cancelled.id, "🗑️ cancelled scheduled run");
        Ok(cancelled)
    }

    /// Cancel the scheduled runs of `pub_id` whose instance sits on `stage_id`
    ///
    /// Runs claimed concurrently by a delivery are left to finish.
    pub async fn cancel_on_stage_exit(
        &self,
        pub_id: &PubId,
        stage_id: &StageId,
    ) -> Result<Vec<ActionRun>> {
        let filter = RunFilter {
            pub_id: Some(*pub_id),
            status: Some(ActionRunStatus::Scheduled),
            ..Default::default()
        };
        let pending = self.storage.list_action_runs(&filter).await?;

        let mut cancelled = Vec::new();
        for run in pending {
            let on_stage = self
                .storage
                .get_action_instance(&run.action_instance_id)
                .await?
                .map_or(true, |instance| instance.stage_id == *stage_id);
            if !on_stage {
                continue;
            }

            let mut next = run;
            next.cancel(format!("pub left stage {}", stage_id));
            if self
                .storage
                .compare_and_set_action_run(ActionRunStatus::Scheduled, next.clone())
                .await?
            {
                self.notifications.publish(&next);
                debug!(action_run_id = %next.id, stage = %stage_id, "cancelled scheduled run on stage exit");
                cancelled.push(next);
            }
        }

        if !cancelled.is_empty() {
            info!(pub_id = %pub_id, stage = %stage_id, count = cancelled.len(), "🚫 cancelled scheduled runs on stage exit");
        }
        Ok(cancelled)
    }

    /// Run every due scheduled run of a community, oldest first
    pub async fn run_due(&self, community_id: &CommunityId) -> Result<Vec<ActionRunResult>> {
        let due = self
            .storage
            .list_due_runs(community_id, self.clock.now())
            .await?;

        let mut results = Vec::with_capacity(due.len());
        for run in due {
            match self.run_delayed_automation(&run.id, None).await {
                Ok(result) => results.push(result),
                Err(err) => warn!(action_run_id = %run.id, "delayed run failed: {}", err),
            }
        }
        Ok(results)
    }

    async fn cancel_if_scheduled(
        &self,
        run: ActionRun,
        reason: impl Into<String>,
    ) -> Result<ActionRunResult> {
        let id = run.id;
        let mut cancelled = run;
        cancelled.cancel(reason);
        if self
            .storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, cancelled.clone())
            .await?
        {
            self.notifications.publish(&cancelled);
            return Ok(ActionRunResult::from_run(&cancelled));
        }
        self.recorded(&id).await
    }

    async fn recorded(&self, id: &ActionRunId) -> Result<ActionRunResult> {
        Ok(ActionRunResult::from_run(&self.load(id).await?))
    }

    async fn load(&self, id: &ActionRunId) -> Result<ActionRun> {
        self.storage
            .get_action_run(id)
            .await?
            .ok_or_else(|| PubflowError::not_found("action run", id))
    }
}
