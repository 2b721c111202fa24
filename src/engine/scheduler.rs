// Scheduler - turns duration automations into scheduled action runs

//! # Scheduler
//!
//! `pubInStageForDuration` automations do not run when the pub enters the
//! stage. The scheduler instead persists a `scheduled` [`ActionRun`] whose
//! `run_at` is the entry time plus the automation's `{ duration, interval }`,
//! computed with calendar-correct arithmetic ([`add_duration`]). The delayed
//! runner picks the run up once it is due.
//!
//! Scheduling is de-duplicated per pub and automation: while a scheduled run
//! for that pair exists, scheduling again returns it instead of creating a
//! second one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::Clock;
use super::events::NotificationChannel;
use super::stack::RunStack;
use super::storage::AutomationStorage;
use crate::models::{
    add_duration, ActionInstance, ActionInstanceId, ActionRun, ActionRunId, Automation,
    AutomationEvent, AutomationId, ConfigError, PubId, StageId,
};
use crate::{PubflowError, Result};

/// A scheduled run as reported back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledActionRun {
    pub action_run_id: ActionRunId,
    pub automation_id: AutomationId,
    pub action_instance_id: ActionInstanceId,
    pub action_instance_name: String,
    pub run_at: DateTime<Utc>,
    /// `false` when an already scheduled run was returned
    pub created: bool,
}

#[derive(Clone)]
pub struct Scheduler {
    storage: Arc<dyn AutomationStorage>,
    clock: Arc<dyn Clock>,
    notifications: NotificationChannel,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn AutomationStorage>,
        clock: Arc<dyn Clock>,
        notifications: NotificationChannel,
    ) -> Self {
        Self {
            storage,
            clock,
            notifications,
        }
    }

    /// Schedule every duration automation on `stage_id` for `pub_id`
    ///
    /// All configs are checked before anything is written, so a bad config
    /// leaves no partial schedule behind.
    pub async fn schedule_action_instances(
        &self,
        pub_id: PubId,
        stage_id: &StageId,
    ) -> Result<Vec<ScheduledActionRun>> {
        let automations = self
            .storage
            .list_automations(stage_id, Some(AutomationEvent::PubInStageForDuration))
            .await?;
        if automations.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut plans = Vec::with_capacity(automations.len());
        for automation in automations {
            let run_at = run_at(&automation, now)?;
            let instance = self.instance(&automation).await?;
            plans.push((automation, instance, run_at));
        }

        let mut scheduled = Vec::with_capacity(plans.len());
        for (automation, instance, run_at) in plans {
            scheduled.push(
                self.persist(&automation, &instance, pub_id, run_at, RunStack::new())
                    .await?,
            );
        }

        debug!(pub_id = %pub_id, stage = %stage_id, count = scheduled.len(), "scheduled duration automations");
        Ok(scheduled)
    }

    /// Schedule one automation for one pub with a caller-supplied stack
    pub async fn schedule_automation(
        &self,
        automation_id: &AutomationId,
        pub_id: PubId,
        stack: RunStack,
    ) -> Result<ScheduledActionRun> {
        let automation = self
            .storage
            .get_automation(automation_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("automation", automation_id))?;
        if automation.event != AutomationEvent::PubInStageForDuration {
            return Err(ConfigError::NotSchedulable(automation.event).into());
        }
        if self.storage.get_pub(&pub_id).await?.is_none() {
            return Err(PubflowError::not_found("pub", pub_id));
        }

        let run_at = run_at(&automation, self.clock.now())?;
        let instance = self.instance(&automation).await?;
        self.persist(&automation, &instance, pub_id, run_at, stack)
            .await
    }

    async fn instance(&self, automation: &Automation) -> Result<ActionInstance> {
        self.storage
            .get_action_instance(&automation.action_instance_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("action instance", automation.action_instance_id))
    }

    async fn persist(
        &self,
        automation: &Automation,
        instance: &ActionInstance,
        pub_id: PubId,
        run_at: DateTime<Utc>,
        stack: RunStack,
    ) -> Result<ScheduledActionRun> {
        let run = ActionRun::scheduled(instance, pub_id, automation.id, run_at, stack.into_vec());
        let (run, created) = self.storage.insert_scheduled_run(run).await?;

        if created {
            self.notifications.publish(&run);
            info!(
                action_run_id = %run.id,
                action_instance = %instance.name,
                pub_id = %pub_id,
                run_at = %run_at,
                "⏰ scheduled action run"
            );
        } else {
            debug!(action_run_id = %run.id, pub_id = %pub_id, "action run already scheduled");
        }

        Ok(ScheduledActionRun {
            action_run_id: run.id,
            automation_id: automation.id,
            action_instance_id: instance.id,
            action_instance_name: instance.name.clone(),
            run_at: run.run_at.unwrap_or(run_at),
            created,
        })
    }
}

fn run_at(automation: &Automation, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let config = automation
        .config
        .duration()
        .ok_or(ConfigError::MissingConfig {
            event: automation.event,
        })?;
    add_duration(now, config)
        .ok_or_else(|| ConfigError::InvalidDuration(config.duration.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::Fixture;
    use crate::models::automation::utc_datetime;
    use crate::models::{ActionRunStatus, AutomationConfig, DurationConfig, Interval};
    use crate::RunFilter;
    use serde_json::json;

    #[tokio::test]
    async fn test_run_at_is_calendar_correct() {
        let fx = Fixture::journal().await;
        fx.clock.set(utc_datetime(2025, 1, 31, 9, 0).unwrap());
        let reminder = fx.instance("Reminder", "email", "under-evaluation").await;
        fx.automate_with(
            AutomationEvent::PubInStageForDuration,
            reminder.id,
            json!({ "duration": 1, "interval": "month" }),
        )
        .await;
        let pub_id = fx.pub_in("under-evaluation").await;

        let scheduled = fx
            .engine
            .scheduler()
            .schedule_action_instances(pub_id, &"under-evaluation".into())
            .await
            .unwrap();

        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].run_at, utc_datetime(2025, 2, 28, 9, 0).unwrap());
        assert_eq!(scheduled[0].action_instance_name, "Reminder");

        let run = fx
            .storage
            .get_action_run(&scheduled[0].action_run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, ActionRunStatus::Scheduled);
        assert!(run.stack.is_empty());
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scheduling_twice_returns_existing_run() {
        let fx = Fixture::journal().await;
        let reminder = fx.instance("Reminder", "email", "under-evaluation").await;
        fx.automate_with(
            AutomationEvent::PubInStageForDuration,
            reminder.id,
            json!({ "duration": 3, "interval": "day" }),
        )
        .await;
        let pub_id = fx.pub_in("under-evaluation").await;
        let scheduler = fx.engine.scheduler();
        let stage = StageId::from("under-evaluation");

        let first = scheduler.schedule_action_instances(pub_id, &stage).await.unwrap();
        fx.clock.advance(chrono::Duration::hours(1));
        let second = scheduler.schedule_action_instances(pub_id, &stage).await.unwrap();

        assert!(first[0].created);
        assert!(!second[0].created);
        assert_eq!(first[0].action_run_id, second[0].action_run_id);
        assert_eq!(first[0].run_at, second[0].run_at);

        let runs = fx
            .storage
            .list_action_runs(&RunFilter {
                status: Some(ActionRunStatus::Scheduled),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_config_writes_nothing() {
        let fx = Fixture::journal().await;
        let good = fx.instance("Good", "log", "under-evaluation").await;
        let bad = fx.instance("Bad", "log", "under-evaluation").await;
        fx.automate_with(
            AutomationEvent::PubInStageForDuration,
            good.id,
            json!({ "duration": 1, "interval": "day" }),
        )
        .await;
        // Stored directly, bypassing validation
        fx.storage
            .create_automation(Automation::new(
                AutomationEvent::PubInStageForDuration,
                bad.id,
                AutomationConfig::Empty,
            ))
            .await
            .unwrap();
        let pub_id = fx.pub_in("under-evaluation").await;

        let err = fx
            .engine
            .scheduler()
            .schedule_action_instances(pub_id, &"under-evaluation".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::Config(ConfigError::MissingConfig { .. })));
        assert!(fx
            .storage
            .list_action_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_schedule_automation_rejects_immediate_events() {
        let fx = Fixture::journal().await;
        let a = fx.instance("A", "log", "submitted").await;
        let automation = fx.automate(AutomationEvent::PubEnteredStage, a.id).await;
        let pub_id = fx.pub_in("submitted").await;

        let err = fx
            .engine
            .scheduler()
            .schedule_automation(&automation.id, pub_id, RunStack::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PubflowError::Config(ConfigError::NotSchedulable(AutomationEvent::PubEnteredStage))
        ));
    }

    #[test]
    fn test_run_at_for_each_interval() {
        let now = utc_datetime(2024, 2, 29, 0, 0).unwrap();
        let expected = [
            (Interval::Minute, utc_datetime(2024, 2, 29, 0, 2)),
            (Interval::Hour, utc_datetime(2024, 2, 29, 2, 0)),
            (Interval::Day, utc_datetime(2024, 3, 2, 0, 0)),
            (Interval::Week, utc_datetime(2024, 3, 14, 0, 0)),
            (Interval::Month, utc_datetime(2024, 4, 29, 0, 0)),
            // no Feb 29 in 2026
            (Interval::Year, utc_datetime(2026, 2, 28, 0, 0)),
        ];
        assert_eq!(expected.len(), Interval::ALL.len());

        for (interval, at) in expected {
            let automation = Automation::new(
                AutomationEvent::PubInStageForDuration,
                ActionInstanceId::new(),
                AutomationConfig::Duration(DurationConfig::new(2, interval)),
            );
            assert_eq!(run_at(&automation, now).unwrap(), at.unwrap(), "{interval}");
        }
    }
}
