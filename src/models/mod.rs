// Core domain models for pubflow
// Pure data: no I/O, no engine state

//! # Domain Models
//!
//! - `ids`: typed identifiers for every entity
//! - `stage`: stages, move constraints and the stage graph
//! - `automation`: event kinds, duration configs, calendar arithmetic
//! - `action`: action instances, automations and action runs
//! - `pub_item`: the pub snapshot actions execute against

pub mod action;
pub mod automation;
pub mod ids;
pub mod pub_item;
pub mod stage;

pub use action::{
    ActionInstance, ActionKind, ActionRun, ActionRunError, ActionRunResult, ActionRunStatus,
    Automation,
};
pub use automation::{
    add_duration, AutomationConfig, AutomationEvent, ConfigError, DurationConfig, Interval,
};
pub use ids::{ActionInstanceId, ActionRunId, AutomationId, CommunityId, PubId, StageId};
pub use pub_item::{PubSnapshot, PubValues};
pub use stage::{MoveConstraint, Stage, StageGraph};
