// Dispatcher - runs action instances and their automation chains

//! # Dispatcher
//!
//! The dispatcher executes one action instance against one pub and records
//! the attempt as an [`ActionRun`]. When the run finishes it fires the
//! `actionSucceeded` or `actionFailed` automations on the same stage,
//! passing each one the parent's stack extended by the parent's run id.
//!
//! ## Execution flow
//!
//! ```text
//! run_action_instance
//!   ├─ recursion check ── refused ──> run recorded as failure, no chain
//!   ├─ create run (running) + publish
//!   └─ execute_claimed
//!        ├─ executor (errors and panics become failure)
//!        ├─ persist terminal status + publish
//!        └─ for each chained automation, in order:
//!             run_action_instance(stack ++ [run.id])
//! ```
//!
//! Execution errors never escape: they end their own run as `failure`. Only
//! configuration problems (unknown instance, unknown pub) and storage
//! failures are returned as `Err`, and those are checked before anything is
//! written.

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::NotificationChannel;
use super::executors::{ActionExecutor, ActionRequest};
use super::stack::RunStack;
use super::storage::AutomationStorage;
use crate::models::{
    ActionInstance, ActionInstanceId, ActionRun, ActionRunError, ActionRunId, ActionRunResult,
    AutomationEvent, AutomationId, PubId, StageId,
};
use crate::{PubflowError, Result};

/// Arguments to [`Dispatcher::run_action_instance`]
#[derive(Debug, Clone)]
pub struct RunActionInstance {
    pub action_instance_id: ActionInstanceId,
    pub pub_id: Option<PubId>,
    pub event: AutomationEvent,
    pub automation_id: Option<AutomationId>,
    pub stack: RunStack,
    pub params: Value,
    pub config_override: Option<Value>,
    /// Caller-chosen run identity; a repeat call with the same id is a no-op
    pub action_run_id: Option<ActionRunId>,
}

impl RunActionInstance {
    pub fn new(
        action_instance_id: ActionInstanceId,
        pub_id: Option<PubId>,
        event: AutomationEvent,
    ) -> Self {
        Self {
            action_instance_id,
            pub_id,
            event,
            automation_id: None,
            stack: RunStack::new(),
            params: Value::Null,
            config_override: None,
            action_run_id: None,
        }
    }

    pub fn automation(mut self, id: AutomationId) -> Self {
        self.automation_id = Some(id);
        self
    }

    pub fn stack(mut self, stack: RunStack) -> Self {
        self.stack = stack;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn config_override(mut self, config: Option<Value>) -> Self {
        self.config_override = config;
        self
    }

    pub fn run_id(mut self, id: ActionRunId) -> Self {
        self.action_run_id = Some(id);
        self
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn AutomationStorage>,
    executor: Arc<dyn ActionExecutor>,
    notifications: NotificationChannel,
    max_stack_depth: usize,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<dyn AutomationStorage>,
        executor: Arc<dyn ActionExecutor>,
        notifications: NotificationChannel,
        max_stack_depth: usize,
    ) -> Self {
        Self {
            storage,
            executor,
            notifications,
            max_stack_depth,
        }
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    /// Execute one action instance for one event, then its chain
    pub fn run_action_instance(
        &self,
        args: RunActionInstance,
    ) -> BoxFuture<'_, Result<ActionRunResult>> {
        async move {
            if let Some(id) = args.action_run_id {
                if let Some(existing) = self.storage.get_action_run(&id).await? {
                    debug!(action_run_id = %id, status = %existing.status, "action run already recorded");
                    return Ok(ActionRunResult::from_run(&existing));
                }
            }

            let instance = self
                .storage
                .get_action_instance(&args.action_instance_id)
                .await?
                .ok_or_else(|| PubflowError::not_found("action instance", args.action_instance_id))?;

            if let Some(pub_id) = args.pub_id {
                let pub_item = self
                    .storage
                    .get_pub(&pub_id)
                    .await?
                    .ok_or_else(|| PubflowError::not_found("pub", pub_id))?;
                if pub_item.community_id != instance.community_id {
                    return Err(PubflowError::InvalidInput(format!(
                        "pub {} is not in community {}",
                        pub_id, instance.community_id
                    )));
                }
            }

            let mut run = ActionRun::running(
                &instance,
                args.pub_id,
                args.event,
                args.stack.clone().into_vec(),
            )
            .with_automation(args.automation_id)
            .with_params(args.params)
            .with_config_override(args.config_override);
            if let Some(id) = args.action_run_id {
                run = run.with_id(id);
            }

            let refusal = args
                .stack
                .check(
                    self.storage.as_ref(),
                    args.action_run_id,
                    instance.id,
                    args.pub_id,
                    self.max_stack_depth,
                )
                .await?;

            if let Some(refusal) = refusal {
                warn!(
                    action_run_id = %run.id,
                    action_instance = %instance.name,
                    depth = args.stack.depth(),
                    "🛑 refusing chained run: {}",
                    refusal
                );
                run.fail(ActionRunError::Recursion {
                    reason: refusal.to_string(),
                });
                let (run, created) = self.create_run(run).await?;
                if created {
                    self.notifications.publish(&run);
                }
                return Ok(ActionRunResult::from_run(&run));
            }

            let (run, created) = self.create_run(run).await?;
            if !created {
                debug!(action_run_id = %run.id, "action run recorded concurrently");
                return Ok(ActionRunResult::from_run(&run));
            }
            self.notifications.publish(&run);
            info!(
                action_run_id = %run.id,
                action_instance = %instance.name,
                event = %run.event,
                depth = run.stack.len(),
                "🚀 running action instance"
            );

            self.execute_claimed(run, instance).await
        }
        .boxed()
    }

    /// Execute a run already in `running`, persist its outcome, fire its chain
    pub fn execute_claimed(
        &self,
        mut run: ActionRun,
        instance: ActionInstance,
    ) -> BoxFuture<'_, Result<ActionRunResult>> {
        async move {
            let pub_snapshot = match run.pub_id {
                Some(pub_id) => self.storage.get_pub(&pub_id).await?,
                None => None,
            };

            let request = ActionRequest {
                action_run_id: run.id,
                action: instance.action.clone(),
                config: instance.effective_config(run.config_override.as_ref()),
                pub_snapshot,
                event: run.event,
                params: run.params.clone(),
            };

            let outcome = AssertUnwindSafe(self.executor.execute(request))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(result)) => run.succeed(result),
                Ok(Err(err)) => run.fail(ActionRunError::Execution {
                    message: format!("{:#}", err),
                }),
                Err(panic) => run.fail(ActionRunError::Execution {
                    message: panic_message(panic.as_ref()),
                }),
            }

            let run = self.storage.update_action_run(run).await?;
            self.notifications.publish(&run);

            match &run.error {
                None => info!(action_run_id = %run.id, action_instance = %instance.name, "✅ action run succeeded"),
                Some(err) => warn!(action_run_id = %run.id, action_instance = %instance.name, "❌ action run failed: {}", err),
            }

            let mut result = ActionRunResult::from_run(&run);
            result.chained = self.run_chain(&run, &instance).await?;
            Ok(result)
        }
        .boxed()
    }

    /// Store a new run, or return the one a concurrent call stored under
    /// the same id (`false`)
    async fn create_run(&self, run: ActionRun) -> Result<(ActionRun, bool)> {
        let id = run.id;
        match self.storage.create_action_run(run).await {
            Ok(run) => Ok((run, true)),
            Err(PubflowError::InvalidState(message)) => {
                match self.storage.get_action_run(&id).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(PubflowError::InvalidState(message)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Fire `actionSucceeded`/`actionFailed` automations for a finished run
    async fn run_chain(
        &self,
        run: &ActionRun,
        instance: &ActionInstance,
    ) -> Result<Vec<ActionRunResult>> {
        let event = if run.error.is_none() {
            AutomationEvent::ActionSucceeded
        } else {
            AutomationEvent::ActionFailed
        };

        let automations = self
            .storage
            .list_automations(&instance.stage_id, Some(event))
            .await?;

        let stack = RunStack::from(run.child_stack());
        let params = json!({
            "sourceActionRunId": run.id,
            "sourceActionInstanceId": instance.id,
            "result": run.result,
            "error": run.error,
        });

        let mut chained = Vec::new();
        for automation in automations.iter().filter(|a| a.watches(&instance.id)) {
            debug!(
                parent = %run.id,
                automation_id = %automation.id,
                event = %event,
                "chaining automation"
            );
            let args = RunActionInstance::new(automation.action_instance_id, run.pub_id, event)
                .automation(automation.id)
                .stack(stack.clone())
                .params(params.clone());

            match self.run_action_instance(args).await {
                Ok(child) => chained.push(child),
                Err(PubflowError::NotFound(what)) => {
                    warn!(automation_id = %automation.id, "skipping chained automation: {} not found", what);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(chained)
    }

    /// Run every automation on `stage_id` wired to `event`, each with a fresh
    /// stack
    ///
    /// Instances run concurrently; each one's own chain stays sequential.
    pub async fn run_instances_for_event(
        &self,
        pub_id: Option<PubId>,
        stage_id: &StageId,
        event: AutomationEvent,
        params: Value,
    ) -> Result<Vec<ActionRunResult>> {
        if event.is_chained() || event == AutomationEvent::PubInStageForDuration {
            return Err(PubflowError::InvalidInput(format!(
                "'{}' is not an externally triggered event",
                event
            )));
        }

        let automations = self.storage.list_automations(stage_id, Some(event)).await?;
        debug!(stage = %stage_id, event = %event, count = automations.len(), "dispatching event");

        let runs = automations.iter().map(|automation| {
            let args = RunActionInstance::new(automation.action_instance_id, pub_id, event)
                .automation(automation.id)
                .params(params.clone());
            self.run_action_instance(args)
        });

        join_all(runs).await.into_iter().collect()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("executor panicked: {}", s)
    } else {
        "executor panicked".to_string()
    }
}
