// Identifiers - strongly typed ids for every workflow entity

//! # Identifiers
//!
//! Stages and communities are identified by human-readable strings
//! ("under-evaluation", "journal-of-things"), the same way workflow states
//! are named in any domain. Everything the engine creates at runtime (pubs,
//! action instances, automations, action runs) gets a UUID.
//!
//! Wrapping each id in its own newtype keeps an `ActionRunId` from ever being
//! passed where an `ActionInstanceId` is expected, which matters a great deal
//! in the dispatcher where both flow through the same call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// **Stage** - a named step in a community's publishing workflow
///
/// ```rust
/// # use pubflow::StageId;
/// let stage = StageId::from("under-evaluation");
/// assert_eq!(stage.as_str(), "under-evaluation");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub String);

impl StageId {
    pub fn new<S: Into<String>>(name: S) -> Self {
        StageId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        StageId(s.to_string())
    }
}

impl From<String> for StageId {
    fn from(s: String) -> Self {
        StageId(s)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// **Community** - the tenant that owns a stage graph, its pubs and automations
///
/// The community slug doubles as its id; it is what appears in
/// `/c/{communitySlug}/...` URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(pub String);

impl CommunityId {
    pub fn new<S: Into<String>>(slug: S) -> Self {
        CommunityId(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommunityId {
    fn from(s: &str) -> Self {
        CommunityId(s.to_string())
    }
}

impl From<String> for CommunityId {
    fn from(s: String) -> Self {
        CommunityId(s)
    }
}

impl std::fmt::Display for CommunityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// A content item moving through the workflow
    PubId
);

uuid_id!(
    /// An action kind bound to a stage with concrete configuration
    ActionInstanceId
);

uuid_id!(
    /// An event binding that fires an action instance
    AutomationId
);

uuid_id!(
    /// One execution attempt of an action instance
    ActionRunId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_creation() {
        let a = StageId::from("draft");
        let b = StageId::from("draft".to_string());
        let c = StageId::new("draft");

        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.to_string(), "draft");
    }

    #[test]
    fn test_uuid_ids_parse_and_display() {
        let id = ActionRunId::new();
        let parsed: ActionRunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ActionRunId>().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let stage = StageId::from("review");
        assert_eq!(serde_json::to_value(&stage).unwrap(), serde_json::json!("review"));

        let run = ActionRunId::new();
        assert_eq!(
            serde_json::to_value(run).unwrap(),
            serde_json::json!(run.0.to_string())
        );
    }
}
