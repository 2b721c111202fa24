// Automation events and rule configuration

//! # Automation Events
//!
//! Every automation is keyed by the **event** that fires it. There is one
//! variant per event kind; the kinds split into two shapes:
//!
//! - **immediate** events fire synchronously when they happen:
//!   `pubEnteredStage`, `pubLeftStage`, `actionSucceeded`, `actionFailed`,
//!   `webhook`
//! - **schedulable** events resolve to a future timestamp instead:
//!   `pubInStageForDuration`, configured with `{ duration, interval }`
//!
//! Raw configuration arrives as JSON. It is validated into
//! [`AutomationConfig`] by the registry before anything is persisted, so a
//! stored automation never carries an invalid config.

use chrono::{DateTime, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The event kinds an automation can be wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutomationEvent {
    PubEnteredStage,
    PubLeftStage,
    PubInStageForDuration,
    ActionSucceeded,
    ActionFailed,
    Webhook,
}

impl AutomationEvent {
    pub const ALL: [AutomationEvent; 6] = [
        AutomationEvent::PubEnteredStage,
        AutomationEvent::PubLeftStage,
        AutomationEvent::PubInStageForDuration,
        AutomationEvent::ActionSucceeded,
        AutomationEvent::ActionFailed,
        AutomationEvent::Webhook,
    ];

    /// Wire name, identical to the serde representation
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationEvent::PubEnteredStage => "pubEnteredStage",
            AutomationEvent::PubLeftStage => "pubLeftStage",
            AutomationEvent::PubInStageForDuration => "pubInStageForDuration",
            AutomationEvent::ActionSucceeded => "actionSucceeded",
            AutomationEvent::ActionFailed => "actionFailed",
            AutomationEvent::Webhook => "webhook",
        }
    }

    /// Events fired by the outcome of another action run
    pub fn is_chained(&self) -> bool {
        matches!(
            self,
            AutomationEvent::ActionSucceeded | AutomationEvent::ActionFailed
        )
    }
}

impl std::fmt::Display for AutomationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AutomationEvent {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AutomationEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownEvent(s.to_string()))
    }
}

/// Calendar unit for duration-based automations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Interval {
    pub const ALL: [Interval; 6] = [
        Interval::Minute,
        Interval::Hour,
        Interval::Day,
        Interval::Week,
        Interval::Month,
        Interval::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Hour => "hour",
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Month => "month",
            Interval::Year => "year",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ duration, interval }` for `pubInStageForDuration`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationConfig {
    pub duration: u32,
    pub interval: Interval,
}

impl DurationConfig {
    pub fn new(duration: u32, interval: Interval) -> Self {
        Self { duration, interval }
    }
}

/// Validated, event-specific automation configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AutomationConfig {
    /// Rule carries no configuration
    Empty,
    /// Rule fires after the pub has stayed in the stage this long
    Duration(DurationConfig),
}

impl AutomationConfig {
    pub fn duration(&self) -> Option<&DurationConfig> {
        match self {
            AutomationConfig::Duration(config) => Some(config),
            AutomationConfig::Empty => None,
        }
    }
}

/// Automation configuration failed validation
///
/// Raised at configuration time only; a config error never reaches execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown automation event '{0}'")]
    UnknownEvent(String),

    #[error("'{event}' takes no configuration, got {got}")]
    UnexpectedConfig { event: AutomationEvent, got: String },

    #[error("'{event}' requires a configuration object")]
    MissingConfig { event: AutomationEvent },

    #[error("duration must be a positive integer, got {0}")]
    InvalidDuration(String),

    #[error("interval must be one of minute, hour, day, week, month, year; got {0}")]
    InvalidInterval(String),

    #[error("unexpected field '{0}' in duration config")]
    UnknownField(String),

    #[error("'{0}' is not a schedulable event")]
    NotSchedulable(AutomationEvent),
}

/// Add `duration` x `interval` to `start`, calendar-correct
///
/// Month and year additions clamp to the last valid day of the target month,
/// so Jan 31 + 1 month lands on Feb 28 (or 29), never Mar 3. Returns `None`
/// only when the result falls outside chrono's representable range.
pub fn add_duration(start: DateTime<Utc>, config: &DurationConfig) -> Option<DateTime<Utc>> {
    let n = config.duration;
    match config.interval {
        Interval::Minute => start.checked_add_signed(chrono::Duration::minutes(n.into())),
        Interval::Hour => start.checked_add_signed(chrono::Duration::hours(n.into())),
        Interval::Day => start.checked_add_signed(chrono::Duration::days(n.into())),
        Interval::Week => start.checked_add_signed(chrono::Duration::weeks(n.into())),
        Interval::Month => start.checked_add_months(Months::new(n)),
        Interval::Year => start.checked_add_months(Months::new(n.checked_mul(12)?)),
    }
}

/// Convenience for tests and seed data: a UTC timestamp from parts
pub fn utc_datetime(y: i32, m: u32, d: u32, h: u32, min: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).single()
}
