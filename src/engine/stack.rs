// Recursion guard for chained automations

//! # Run Stack
//!
//! Every dispatch carries a [`RunStack`]: the ids of the action runs that led
//! to it, oldest first. The stack is a plain value. Each chain hop clones it
//! and appends the parent run's id, so unrelated chains never share state and
//! can run in parallel.
//!
//! Before a run is executed the dispatcher asks [`RunStack::check`] whether
//! it may proceed. A run is refused when:
//!
//! 1. its own id is already on the stack (re-entrant dispatch of the same run)
//! 2. the stack is longer than the configured maximum depth
//! 3. an ancestor on the stack already executed the same action instance
//!    against the same pub (a cycle through the automation graph)
//!
//! Ancestors are looked up in storage, which acts as the arena the ids point
//! into.

use serde::{Deserialize, Serialize};

use super::storage::AutomationStorage;
use crate::models::{ActionInstanceId, ActionRunId, PubId};
use crate::Result;

/// Ordered ancestor run ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunStack(Vec<ActionRunId>);

/// Why a run was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    AlreadyOnStack(ActionRunId),
    TooDeep { depth: usize, max: usize },
    Cycle { ancestor: ActionRunId },
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Refusal::AlreadyOnStack(id) => write!(f, "action run {} is already on the stack", id),
            Refusal::TooDeep { depth, max } => {
                write!(f, "stack depth {} exceeds maximum of {}", depth, max)
            }
            Refusal::Cycle { ancestor } => write!(
                f,
                "ancestor run {} already ran this action instance for this pub",
                ancestor
            ),
        }
    }
}

impl RunStack {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &ActionRunId) -> bool {
        self.0.contains(id)
    }

    pub fn ids(&self) -> &[ActionRunId] {
        &self.0
    }

    /// The stack handed to runs triggered by `parent`
    pub fn push(&self, parent: ActionRunId) -> RunStack {
        let mut ids = self.0.clone();
        ids.push(parent);
        RunStack(ids)
    }

    pub fn into_vec(self) -> Vec<ActionRunId> {
        self.0
    }

    /// Decide whether a run may execute under this stack
    ///
    /// `run_id` is the identity the run will be recorded under, when the
    /// caller already knows it. Missing ancestors are skipped: the stack
    /// may name runs from a storage the caller cannot see.
    pub async fn check(
        &self,
        storage: &dyn AutomationStorage,
        run_id: Option<ActionRunId>,
        action_instance_id: ActionInstanceId,
        pub_id: Option<PubId>,
        max_depth: usize,
    ) -> Result<Option<Refusal>> {
        if let Some(id) = run_id {
            if self.contains(&id) {
                return Ok(Some(Refusal::AlreadyOnStack(id)));
            }
        }

        if self.depth() > max_depth {
            return Ok(Some(Refusal::TooDeep {
                depth: self.depth(),
                max: max_depth,
            }));
        }

        for ancestor_id in &self.0 {
            let ancestor = match storage.get_action_run(ancestor_id).await? {
                Some(run) => run,
                None => continue,
            };
            if ancestor.action_instance_id == action_instance_id && ancestor.pub_id == pub_id {
                return Ok(Some(Refusal::Cycle {
                    ancestor: ancestor.id,
                }));
            }
        }

        Ok(None)
    }
}

impl From<Vec<ActionRunId>> for RunStack {
    fn from(ids: Vec<ActionRunId>) -> Self {
        RunStack(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::models::{ActionInstance, ActionRun, AutomationEvent, Stage};
    use serde_json::json;

    async fn storage_with_instance() -> (InMemoryStorage, ActionInstance) {
        let storage = InMemoryStorage::new();
        storage
            .create_stage(Stage::new("review", "Review", 0, "journal"))
            .await
            .unwrap();
        let instance = storage
            .create_action_instance(ActionInstance::new("Log", "log", "review", "journal", json!({})))
            .await
            .unwrap();
        (storage, instance)
    }

    #[test]
    fn test_push_grows_by_one_and_leaves_parent_untouched() {
        let root = RunStack::new();
        let a = ActionRunId::new();
        let child = root.push(a);
        let grandchild = child.push(ActionRunId::new());

        assert_eq!(root.depth(), 0);
        assert_eq!(child.depth(), 1);
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.ids()[0], a);
    }

    #[tokio::test]
    async fn test_refuses_run_already_on_stack() {
        let (storage, instance) = storage_with_instance().await;
        let id = ActionRunId::new();
        let stack = RunStack::from(vec![id]);

        let refusal = stack
            .check(&storage, Some(id), instance.id, None, 10)
            .await
            .unwrap();
        assert_eq!(refusal, Some(Refusal::AlreadyOnStack(id)));
    }

    #[tokio::test]
    async fn test_refuses_past_max_depth() {
        let (storage, instance) = storage_with_instance().await;
        let stack = RunStack::from((0..4).map(|_| ActionRunId::new()).collect::<Vec<_>>());

        assert_eq!(
            stack.check(&storage, None, instance.id, None, 4).await.unwrap(),
            None
        );
        assert_eq!(
            stack.check(&storage, None, instance.id, None, 3).await.unwrap(),
            Some(Refusal::TooDeep { depth: 4, max: 3 })
        );
    }

    #[tokio::test]
    async fn test_refuses_cycle_through_ancestor() {
        let (storage, instance) = storage_with_instance().await;
        let pub_id = PubId::new();
        let ancestor = storage
            .create_action_run(ActionRun::running(
                &instance,
                Some(pub_id),
                AutomationEvent::PubEnteredStage,
                vec![],
            ))
            .await
            .unwrap();
        let stack = RunStack::new().push(ancestor.id);

        assert_eq!(
            stack
                .check(&storage, None, instance.id, Some(pub_id), 10)
                .await
                .unwrap(),
            Some(Refusal::Cycle {
                ancestor: ancestor.id
            })
        );
        // Same instance against a different pub is not a cycle
        assert_eq!(
            stack
                .check(&storage, None, instance.id, Some(PubId::new()), 10)
                .await
                .unwrap(),
            None
        );
    }
}
