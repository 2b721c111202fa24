// Pub snapshot - the content item actions run against

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CommunityId, PubId};

/// Field values keyed by field slug
pub type PubValues = serde_json::Map<String, serde_json::Value>;

/// A pub's current values, as handed to an action executor
///
/// Field editing lives outside the engine; this is a read-only snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSnapshot {
    pub id: PubId,
    pub community_id: CommunityId,
    pub values: PubValues,
    pub updated_at: DateTime<Utc>,
}

impl PubSnapshot {
    pub fn new(community_id: impl Into<CommunityId>) -> Self {
        Self {
            id: PubId::new(),
            community_id: community_id.into(),
            values: PubValues::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_value(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(field.into(), value);
        self.updated_at = Utc::now();
        self
    }

    pub fn value(&self, field: &str) -> Option<&serde_json::Value> {
        self.values.get(field)
    }
}
