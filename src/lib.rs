// pubflow - automation engine for stage-based publishing workflows
// Pubs move through community-defined stages; automations react to that movement

//! # pubflow
//!
//! The automation and action execution engine behind a publishing workflow.
//! Content items ("pubs") move through a community's stages. Every stage can
//! carry **action instances** (an action kind plus its config), and each
//! instance is fired by **automations** wired to workflow events.
//!
//! ## Core Components
//!
//! ### Domain Models ([`models`])
//! - [`StageGraph`]: stages and the move constraints between them
//! - [`AutomationEvent`] / [`AutomationConfig`]: what fires an automation
//! - [`ActionInstance`], [`Automation`], [`ActionRun`]: bindings and the audit trail
//!
//! ### Engine ([`engine`])
//! - [`AutomationRegistry`]: static event catalog and config validation
//! - [`Dispatcher`]: runs action instances and their `actionSucceeded` /
//!   `actionFailed` chains, guarded by an explicit ancestor [`RunStack`]
//! - [`Scheduler`]: turns `pubInStageForDuration` into scheduled runs
//! - [`DelayedRunner`]: executes (or cancels) due scheduled runs
//! - [`NotificationChannel`]: best-effort run status broadcast
//! - [`AutomationEngine`]: the facade tying them together
//!
//! ### Server ([`server`])
//! Axum HTTP surface exposing the engine as a bearer-authenticated RPC API,
//! the inbound webhook endpoint and a server-sent-events status stream.

pub mod config;
pub mod engine;
pub mod models;
pub mod server;

pub use models::{
    add_duration, ActionInstance, ActionInstanceId, ActionKind, ActionRun, ActionRunError,
    ActionRunId, ActionRunResult, ActionRunStatus, Automation, AutomationConfig,
    AutomationEvent, AutomationId, CommunityId, ConfigError, DurationConfig, Interval,
    MoveConstraint, PubId, PubSnapshot, Stage, StageGraph, StageId,
};

pub use engine::{
    clock::{Clock, SystemClock},
    delayed::DelayedRunner,
    dispatcher::{Dispatcher, RunActionInstance},
    events::{ActionRunNotification, NotificationChannel, NotificationFilter},
    executors::{ActionExecutor, ActionHandler, ActionKindRegistry, ActionRequest},
    registry::{AutomationRegistry, AutomationRule, RuleKind},
    scheduler::{ScheduledActionRun, Scheduler},
    stack::RunStack,
    storage::{AutomationStorage, InMemoryStorage, RunFilter},
    AutomationEngine, EngineConfig, MoveOutcome,
};

pub use config::ServerConfig;
pub use server::{PubflowServer, PubflowServerBuilder};

use thiserror::Error;

/// Error type for every engine and server operation
///
/// Run-level failures (a recursion refusal, an executor error) are not
/// here: they are recorded on the [`ActionRun`] as an [`ActionRunError`]
/// and never escape the dispatcher.
#[derive(Error, Debug)]
pub enum PubflowError {
    /// Automation configuration failed validation
    #[error("Invalid automation config: {0}")]
    Config(#[from] ConfigError),

    /// Referenced stage, pub, instance, automation or run does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted on an action run in the wrong status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PubflowError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        PubflowError::NotFound(format!("{} {}", what, id))
    }

    /// Short machine-readable name used in HTTP error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            PubflowError::Config(_) => "config_error",
            PubflowError::NotFound(_) => "not_found",
            PubflowError::InvalidState(_) => "invalid_state",
            PubflowError::InvalidInput(_) => "invalid_input",
            PubflowError::Unauthorized(_) => "unauthorized",
            PubflowError::Storage(_) => "storage_error",
            PubflowError::Serialization(_) => "serialization_error",
            PubflowError::Internal(_) => "internal_error",
        }
    }
}

/// Results that use [`PubflowError`]
pub type Result<T> = std::result::Result<T, PubflowError>;
