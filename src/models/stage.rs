// Stage graph - a community's workflow stages and legal moves between them

//! # Stage Graph
//!
//! Pubs flow through **stages** via **move constraints**:
//!
//! ```text
//!     [submitted] --> [under-evaluation] --> [accepted]
//!          ^                  |
//!          |                  v
//!          +-------------[rejected]
//! ```
//!
//! - A `Stage` is a named step owned by exactly one community.
//! - A `MoveConstraint` is a directed edge `stage_id -> destination_id`.
//! - The graph may contain cycles (resubmission loops are normal); nothing
//!   here assumes acyclicity.
//!
//! `StageGraph` is pure data plus traversal. It answers questions and never
//! fails: an unknown stage simply has no neighbours. Rejecting an illegal
//! move is the caller's job.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::ids::{CommunityId, StageId};

/// A named step in a community's publishing workflow
///
/// The pub currently occupying a stage is tracked separately (the
/// pub-in-stage relation in storage), not on the stage itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    /// Display order within the community's stage list
    pub order: u32,
    pub community_id: CommunityId,
}

impl Stage {
    pub fn new<I, N, C>(id: I, name: N, order: u32, community_id: C) -> Self
    where
        I: Into<StageId>,
        N: Into<String>,
        C: Into<CommunityId>,
    {
        Stage {
            id: id.into(),
            name: name.into(),
            order,
            community_id: community_id.into(),
        }
    }
}

/// A directed, legal transition between two stages of one community
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveConstraint {
    pub stage_id: StageId,
    pub destination_id: StageId,
}

impl MoveConstraint {
    pub fn new<F: Into<StageId>, T: Into<StageId>>(stage_id: F, destination_id: T) -> Self {
        MoveConstraint {
            stage_id: stage_id.into(),
            destination_id: destination_id.into(),
        }
    }
}

/// Read-only view over one community's stages and move constraints
///
/// Edges whose endpoints are not both stages of this community are dropped
/// at construction, so every query answers for the community alone.
#[derive(Debug, Clone)]
pub struct StageGraph {
    community_id: CommunityId,
    stages: HashMap<StageId, Stage>,
    outgoing: HashMap<StageId, BTreeSet<StageId>>,
    incoming: HashMap<StageId, BTreeSet<StageId>>,
}

impl StageGraph {
    /// Build the graph for `community_id` from stage and constraint records
    pub fn new(
        community_id: CommunityId,
        stages: impl IntoIterator<Item = Stage>,
        constraints: impl IntoIterator<Item = MoveConstraint>,
    ) -> Self {
        let stages: HashMap<StageId, Stage> = stages
            .into_iter()
            .filter(|s| s.community_id == community_id)
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut outgoing: HashMap<StageId, BTreeSet<StageId>> = HashMap::new();
        let mut incoming: HashMap<StageId, BTreeSet<StageId>> = HashMap::new();

        for edge in constraints {
            if !stages.contains_key(&edge.stage_id) || !stages.contains_key(&edge.destination_id) {
                tracing::debug!(
                    from = %edge.stage_id,
                    to = %edge.destination_id,
                    community = %community_id,
                    "ignoring move constraint outside community"
                );
                continue;
            }
            outgoing
                .entry(edge.stage_id.clone())
                .or_default()
                .insert(edge.destination_id.clone());
            incoming
                .entry(edge.destination_id)
                .or_default()
                .insert(edge.stage_id);
        }

        StageGraph {
            community_id,
            stages,
            outgoing,
            incoming,
        }
    }

    pub fn community_id(&self) -> &CommunityId {
        &self.community_id
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.stages.contains_key(id)
    }

    /// Stages sorted by display order
    pub fn stages(&self) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self.stages.values().collect();
        stages.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        stages
    }

    /// Destinations reachable by exactly one move constraint
    pub fn neighbors(&self, stage_id: &StageId) -> BTreeSet<StageId> {
        self.outgoing.get(stage_id).cloned().unwrap_or_default()
    }

    /// Stages with an edge leading into `stage_id`
    pub fn sources(&self, stage_id: &StageId) -> BTreeSet<StageId> {
        self.incoming.get(stage_id).cloned().unwrap_or_default()
    }

    /// True iff a move constraint `from -> to` exists in this community
    pub fn is_legal_move(&self, from: &StageId, to: &StageId) -> bool {
        self.outgoing
            .get(from)
            .map_or(false, |destinations| destinations.contains(to))
    }

    /// Every stage reachable from `start` by one or more moves
    ///
    /// Breadth-first with a visited set, so cycles terminate. `start` itself
    /// is included only if some cycle leads back to it.
    pub fn reachable(&self, start: &StageId) -> BTreeSet<StageId> {
        let mut seen: HashSet<&StageId> = HashSet::new();
        let mut reached = BTreeSet::new();
        let mut queue: VecDeque<&StageId> = VecDeque::new();
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(next) = self.outgoing.get(current) {
                for destination in next {
                    reached.insert(destination.clone());
                    queue.push_back(destination);
                }
            }
        }

        reached
    }
}
