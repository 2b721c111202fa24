// Automation registry - the static catalog of automation rules

//! # Automation Registry
//!
//! One [`AutomationRule`] per [`AutomationEvent`], built once on first use
//! and shared for the life of the process. The registry answers three
//! questions and never mutates:
//!
//! - which rule handles an event (`rule_for_event`)
//! - whether that rule is scheduled rather than fired immediately
//!   (`is_schedulable`)
//! - whether a raw JSON config is valid for the event (`validate_config`)
//!
//! ## Example
//!
//! ```rust
//! use pubflow::{AutomationEvent, AutomationRegistry, AutomationConfig, Interval};
//! use serde_json::json;
//!
//! let registry = AutomationRegistry::global();
//! assert!(registry.is_schedulable(AutomationEvent::PubInStageForDuration));
//!
//! let config = registry
//!     .validate_config(
//!         AutomationEvent::PubInStageForDuration,
//!         Some(&json!({ "duration": 3, "interval": "day" })),
//!     )
//!     .unwrap();
//! assert_eq!(config.duration().map(|d| d.interval), Some(Interval::Day));
//! ```

use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::models::{AutomationConfig, AutomationEvent, ConfigError, DurationConfig, Interval};

/// Whether a rule fires on the event or is deferred to a computed time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleKind {
    Immediate,
    Schedulable,
}

/// Immutable catalog entry for one event kind
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub event: AutomationEvent,
    pub kind: RuleKind,
    pub display_name: &'static str,
    pub description: &'static str,
    /// JSON Schema for the rule's config, `None` when it takes no config
    pub config_schema: Option<Value>,
}

impl AutomationRule {
    fn immediate(
        event: AutomationEvent,
        display_name: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            event,
            kind: RuleKind::Immediate,
            display_name,
            description,
            config_schema: None,
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.kind == RuleKind::Schedulable
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: AutomationRegistry = AutomationRegistry::build();
}

/// Lookup table from event kind to rule
#[derive(Debug, Clone)]
pub struct AutomationRegistry {
    rules: BTreeMap<AutomationEvent, AutomationRule>,
}

impl AutomationRegistry {
    /// The process-wide registry
    pub fn global() -> &'static AutomationRegistry {
        &GLOBAL_REGISTRY
    }

    fn build() -> Self {
        let intervals: Vec<&str> = Interval::ALL.iter().map(|i| i.as_str()).collect();

        let rules = vec![
            AutomationRule::immediate(
                AutomationEvent::PubEnteredStage,
                "a pub enters this stage",
                "Runs when a pub is moved into the stage",
            ),
            AutomationRule::immediate(
                AutomationEvent::PubLeftStage,
                "a pub leaves this stage",
                "Runs when a pub is moved out of the stage",
            ),
            AutomationRule {
                event: AutomationEvent::PubInStageForDuration,
                kind: RuleKind::Schedulable,
                display_name: "a pub stays in this stage for a duration",
                description: "Runs once a pub has been in the stage for the configured time",
                config_schema: Some(json!({
                    "type": "object",
                    "required": ["duration", "interval"],
                    "additionalProperties": false,
                    "properties": {
                        "duration": { "type": "integer", "minimum": 1 },
                        "interval": { "type": "string", "enum": intervals },
                    },
                })),
            },
            AutomationRule::immediate(
                AutomationEvent::ActionSucceeded,
                "an action succeeds",
                "Runs after another action on the stage completes successfully",
            ),
            AutomationRule::immediate(
                AutomationEvent::ActionFailed,
                "an action fails",
                "Runs after another action on the stage fails",
            ),
            AutomationRule::immediate(
                AutomationEvent::Webhook,
                "a webhook is received",
                "Runs when the automation's webhook URL is called",
            ),
        ];

        Self {
            rules: rules.into_iter().map(|rule| (rule.event, rule)).collect(),
        }
    }

    pub fn rule_for_event(&self, event: AutomationEvent) -> Option<&AutomationRule> {
        self.rules.get(&event)
    }

    pub fn rules(&self) -> impl Iterator<Item = &AutomationRule> {
        self.rules.values()
    }

    pub fn is_schedulable(&self, event: AutomationEvent) -> bool {
        self.rule_for_event(event)
            .map_or(false, AutomationRule::is_schedulable)
    }

    pub fn schedulable_events(&self) -> Vec<AutomationEvent> {
        self.rules()
            .filter(|rule| rule.is_schedulable())
            .map(|rule| rule.event)
            .collect()
    }

    pub fn immediate_events(&self) -> Vec<AutomationEvent> {
        self.rules()
            .filter(|rule| !rule.is_schedulable())
            .map(|rule| rule.event)
            .collect()
    }

    /// Validate `raw` against the event's config schema
    ///
    /// Rules without config accept only an absent, `null` or empty-object
    /// config.
    pub fn validate_config(
        &self,
        event: AutomationEvent,
        raw: Option<&Value>,
    ) -> Result<AutomationConfig, ConfigError> {
        let raw = raw.filter(|value| !value.is_null());

        if !self.is_schedulable(event) {
            return match raw {
                None => Ok(AutomationConfig::Empty),
                Some(Value::Object(map)) if map.is_empty() => Ok(AutomationConfig::Empty),
                Some(other) => Err(ConfigError::UnexpectedConfig {
                    event,
                    got: other.to_string(),
                }),
            };
        }

        let map = match raw {
            Some(Value::Object(map)) => map,
            _ => return Err(ConfigError::MissingConfig { event }),
        };

        if let Some(unknown) = map
            .keys()
            .find(|key| key.as_str() != "duration" && key.as_str() != "interval")
        {
            return Err(ConfigError::UnknownField(unknown.clone()));
        }

        let duration = match map.get("duration") {
            Some(value) => value
                .as_u64()
                .filter(|n| *n >= 1)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| ConfigError::InvalidDuration(value.to_string()))?,
            None => return Err(ConfigError::InvalidDuration("missing".to_string())),
        };

        let interval = match map.get("interval") {
            Some(value) => serde_json::from_value::<Interval>(value.clone())
                .map_err(|_| ConfigError::InvalidInterval(value.to_string()))?,
            None => return Err(ConfigError::InvalidInterval("missing".to_string())),
        };

        Ok(AutomationConfig::Duration(DurationConfig::new(duration, interval)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_event_has_a_rule() {
        let registry = AutomationRegistry::global();
        for event in AutomationEvent::ALL {
            let rule = registry.rule_for_event(event).unwrap();
            assert_eq!(rule.event, event);
        }
        assert_eq!(
            registry.schedulable_events(),
            vec![AutomationEvent::PubInStageForDuration]
        );
        assert_eq!(registry.immediate_events().len(), 5);
    }

    #[test]
    fn test_immediate_rules_accept_only_empty_config() {
        let registry = AutomationRegistry::global();
        let event = AutomationEvent::PubEnteredStage;

        assert_eq!(registry.validate_config(event, None), Ok(AutomationConfig::Empty));
        assert_eq!(
            registry.validate_config(event, Some(&Value::Null)),
            Ok(AutomationConfig::Empty)
        );
        assert_eq!(
            registry.validate_config(event, Some(&json!({}))),
            Ok(AutomationConfig::Empty)
        );
        assert!(matches!(
            registry.validate_config(event, Some(&json!({ "duration": 1 }))),
            Err(ConfigError::UnexpectedConfig { .. })
        ));
    }

    #[test]
    fn test_duration_config_validation() {
        let registry = AutomationRegistry::global();
        let event = AutomationEvent::PubInStageForDuration;

        let ok = registry.validate_config(event, Some(&json!({ "duration": 2, "interval": "week" })));
        assert_eq!(
            ok,
            Ok(AutomationConfig::Duration(DurationConfig::new(2, Interval::Week)))
        );

        let cases = [
            (json!({ "duration": 0, "interval": "day" }), "zero"),
            (json!({ "duration": -3, "interval": "day" }), "negative"),
            (json!({ "duration": 1.5, "interval": "day" }), "fractional"),
            (json!({ "duration": "3", "interval": "day" }), "string"),
            (json!({ "interval": "day" }), "missing"),
        ];
        for (raw, label) in cases {
            assert!(
                matches!(
                    registry.validate_config(event, Some(&raw)),
                    Err(ConfigError::InvalidDuration(_))
                ),
                "{label}"
            );
        }

        assert!(matches!(
            registry.validate_config(event, Some(&json!({ "duration": 1, "interval": "fortnight" }))),
            Err(ConfigError::InvalidInterval(_))
        ));
        assert!(matches!(
            registry.validate_config(event, Some(&json!({ "duration": 1, "interval": "day", "at": 9 }))),
            Err(ConfigError::UnknownField(_))
        ));
        assert_eq!(
            registry.validate_config(event, None),
            Err(ConfigError::MissingConfig { event })
        );
    }

    #[test]
    fn test_schema_lists_every_interval() {
        let rule = AutomationRegistry::global()
            .rule_for_event(AutomationEvent::PubInStageForDuration)
            .unwrap();
        let schema = rule.config_schema.as_ref().unwrap();
        let intervals = schema["properties"]["interval"]["enum"].as_array().unwrap();
        assert_eq!(intervals.len(), Interval::ALL.len());
    }
}
