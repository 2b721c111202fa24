// Action domain models - instances, automations and runs

//! # Action Models
//!
//! - [`ActionInstance`]: an action kind bound to a stage with its own config
//! - [`Automation`]: wires an event (plus validated config) to an instance
//! - [`ActionRun`]: one execution attempt, the engine's audit record
//!
//! ## Run lifecycle
//!
//! ```text
//!   scheduled ──claim──> running ──> success
//!       │                   └──────> failure
//!       └──cancel──> cancelled
//! ```
//!
//! Runs created for immediate events start directly in `running`. Status
//! transitions only move forward: once a run is `success`, `failure` or
//! `cancelled` it is never reopened. Runs are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::automation::{AutomationConfig, AutomationEvent};
use super::ids::{ActionInstanceId, ActionRunId, AutomationId, CommunityId, PubId, StageId};

/// Opaque action kind understood by the executor ("email", "http", "log", ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionKind(pub String);

impl ActionKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An action bound to a stage with concrete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionInstance {
    pub id: ActionInstanceId,
    pub name: String,
    pub action: ActionKind,
    pub stage_id: StageId,
    pub community_id: CommunityId,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ActionInstance {
    pub fn new(
        name: impl Into<String>,
        action: impl Into<ActionKind>,
        stage_id: impl Into<StageId>,
        community_id: impl Into<CommunityId>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: ActionInstanceId::new(),
            name: name.into(),
            action: action.into(),
            stage_id: stage_id.into(),
            community_id: community_id.into(),
            config,
            created_at: Utc::now(),
        }
    }

    /// Instance config with `overrides` merged over it, key by key
    ///
    /// Only top-level keys are merged. A non-object override is ignored.
    pub fn effective_config(&self, overrides: Option<&serde_json::Value>) -> serde_json::Value {
        match (self.config.as_object(), overrides.and_then(|o| o.as_object())) {
            (Some(base), Some(extra)) => {
                let mut merged = base.clone();
                for (key, value) in extra {
                    merged.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(merged)
            }
            (None, Some(extra)) if self.config.is_null() => serde_json::Value::Object(extra.clone()),
            _ => self.config.clone(),
        }
    }
}

/// An event binding that fires an action instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Automation {
    pub id: AutomationId,
    pub event: AutomationEvent,
    pub action_instance_id: ActionInstanceId,
    pub config: AutomationConfig,
    /// For `actionSucceeded`/`actionFailed`: only this instance's outcome
    /// fires the automation. `None` means any instance on the same stage.
    pub source_action_instance_id: Option<ActionInstanceId>,
    pub created_at: DateTime<Utc>,
}

impl Automation {
    pub fn new(
        event: AutomationEvent,
        action_instance_id: ActionInstanceId,
        config: AutomationConfig,
    ) -> Self {
        Self {
            id: AutomationId::new(),
            event,
            action_instance_id,
            config,
            source_action_instance_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn watching(mut self, source: ActionInstanceId) -> Self {
        self.source_action_instance_id = Some(source);
        self
    }

    /// Whether a finished run of `source` should fire this automation
    pub fn watches(&self, source: &ActionInstanceId) -> bool {
        self.source_action_instance_id
            .map_or(true, |watched| watched == *source)
    }
}

/// Status of an action run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionRunStatus {
    Scheduled,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl ActionRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionRunStatus::Success | ActionRunStatus::Failure | ActionRunStatus::Cancelled
        )
    }

    /// Forward-only lifecycle check
    pub fn can_transition_to(&self, next: ActionRunStatus) -> bool {
        use ActionRunStatus::*;
        matches!(
            (self, next),
            (Scheduled, Running) | (Scheduled, Cancelled) | (Running, Success) | (Running, Failure)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionRunStatus::Scheduled => "scheduled",
            ActionRunStatus::Running => "running",
            ActionRunStatus::Success => "success",
            ActionRunStatus::Failure => "failure",
            ActionRunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ActionRunStatus::Scheduled),
            "running" => Ok(ActionRunStatus::Running),
            "success" => Ok(ActionRunStatus::Success),
            "failure" => Ok(ActionRunStatus::Failure),
            "cancelled" => Ok(ActionRunStatus::Cancelled),
            other => Err(format!("unknown action run status '{}'", other)),
        }
    }
}

/// Why a run ended in `failure` (or `cancelled`)
///
/// Persisted on the run itself; these never propagate past the dispatcher.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionRunError {
    /// The chain would re-run an ancestor or grew past the depth limit
    #[error("recursion refused: {reason}")]
    Recursion { reason: String },

    /// The executor returned an error or panicked
    #[error("execution failed: {message}")]
    Execution { message: String },

    /// A scheduled run that no longer applies
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

/// One execution attempt of an action instance against a pub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRun {
    pub id: ActionRunId,
    pub action_instance_id: ActionInstanceId,
    pub automation_id: Option<AutomationId>,
    pub community_id: CommunityId,
    /// `None` for runs not tied to a pub (inbound webhooks)
    pub pub_id: Option<PubId>,
    pub event: AutomationEvent,
    pub status: ActionRunStatus,
    pub run_at: Option<DateTime<Utc>>,
    /// Event data handed to the executor (webhook body, source run, ...)
    pub params: serde_json::Value,
    pub config_override: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ActionRunError>,
    /// Ancestor run ids that led to this run, oldest first
    pub stack: Vec<ActionRunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionRun {
    /// A run that starts executing right away
    pub fn running(
        instance: &ActionInstance,
        pub_id: Option<PubId>,
        event: AutomationEvent,
        stack: Vec<ActionRunId>,
    ) -> Self {
        Self::with_status(instance, pub_id, event, stack, ActionRunStatus::Running)
    }

    /// A run deferred until `run_at`
    pub fn scheduled(
        instance: &ActionInstance,
        pub_id: PubId,
        automation_id: AutomationId,
        run_at: DateTime<Utc>,
        stack: Vec<ActionRunId>,
    ) -> Self {
        let mut run = Self::with_status(
            instance,
            Some(pub_id),
            AutomationEvent::PubInStageForDuration,
            stack,
            ActionRunStatus::Scheduled,
        );
        run.automation_id = Some(automation_id);
        run.run_at = Some(run_at);
        run
    }

    fn with_status(
        instance: &ActionInstance,
        pub_id: Option<PubId>,
        event: AutomationEvent,
        stack: Vec<ActionRunId>,
        status: ActionRunStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ActionRunId::new(),
            action_instance_id: instance.id,
            automation_id: None,
            community_id: instance.community_id.clone(),
            pub_id,
            event,
            status,
            run_at: None,
            params: serde_json::Value::Null,
            config_override: None,
            result: None,
            error: None,
            stack,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: ActionRunId) -> Self {
        self.id = id;
        self
    }

    pub fn with_automation(mut self, automation_id: Option<AutomationId>) -> Self {
        self.automation_id = automation_id;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_config_override(mut self, config: Option<serde_json::Value>) -> Self {
        self.config_override = config;
        self
    }

    /// Mark the run successful with the executor's result
    pub fn succeed(&mut self, result: serde_json::Value) {
        self.finish(ActionRunStatus::Success);
        self.result = Some(result);
    }

    /// Mark the run failed
    pub fn fail(&mut self, error: ActionRunError) {
        self.finish(ActionRunStatus::Failure);
        self.error = Some(error);
    }

    /// Cancel a scheduled run
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.finish(ActionRunStatus::Cancelled);
        self.error = Some(ActionRunError::Cancelled {
            reason: reason.into(),
        });
    }

    fn finish(&mut self, status: ActionRunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Stack handed to automations this run triggers
    pub fn child_stack(&self) -> Vec<ActionRunId> {
        let mut stack = self.stack.clone();
        stack.push(self.id);
        stack
    }

    /// Whether the run is due at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ActionRunStatus::Scheduled && self.run_at.map_or(false, |at| at <= now)
    }
}

/// Outcome of dispatching one action instance, including its chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunResult {
    pub action_run_id: ActionRunId,
    pub action_instance_id: ActionInstanceId,
    pub status: ActionRunStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ActionRunError>,
    /// Results of `actionSucceeded`/`actionFailed` automations this run fired
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chained: Vec<ActionRunResult>,
}

impl ActionRunResult {
    pub fn from_run(run: &ActionRun) -> Self {
        Self {
            action_run_id: run.id,
            action_instance_id: run.action_instance_id,
            status: run.status,
            result: run.result.clone(),
            error: run.error.clone(),
            chained: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ActionRunStatus::Success
    }

    /// Every result in this subtree, depth first, this run included
    pub fn flatten(&self) -> Vec<&ActionRunResult> {
        let mut out = vec![self];
        for child in &self.chained {
            out.extend(child.flatten());
        }
        out
    }
}
