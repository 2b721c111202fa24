// Storage abstraction for the automation engine
// Stages, action instances, automations, pubs and the action run audit trail

//! # Storage Abstraction Layer
//!
//! The engine never touches a database directly. Everything it persists goes
//! through [`AutomationStorage`], so the same dispatcher, scheduler and
//! delayed runner work against the in-memory backend in tests and against a
//! real database in production.
//!
//! ## Atomic status transitions
//!
//! Action run status changes that can race (claiming a scheduled run,
//! cancelling one) go through [`AutomationStorage::compare_and_set_action_run`].
//! The stored run is replaced only if its status still matches the expected
//! one, so exactly one of two concurrent claimers wins.
//!
//! ## Thread Safety
//!
//! [`InMemoryStorage`] keeps each table in a `DashMap`. Per-key locking makes
//! a compare-and-set on one run atomic without blocking unrelated runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::models::{
    ActionInstance, ActionInstanceId, ActionRun, ActionRunId, ActionRunStatus, Automation,
    AutomationEvent, AutomationId, CommunityId, MoveConstraint, PubId, PubSnapshot, Stage,
    StageGraph, StageId,
};
use crate::{PubflowError, Result};

/// Query over the action run table
///
/// Every set field must match; unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub community_id: Option<CommunityId>,
    pub status: Option<ActionRunStatus>,
    pub pub_id: Option<PubId>,
    pub action_instance_id: Option<ActionInstanceId>,
    pub automation_id: Option<AutomationId>,
    /// Only runs whose `run_at` is at or before this instant
    pub due_before: Option<DateTime<Utc>>,
}

impl RunFilter {
    pub fn community(community_id: impl Into<CommunityId>) -> Self {
        Self {
            community_id: Some(community_id.into()),
            ..Default::default()
        }
    }

    /// Scheduled runs of `community_id` that are due at `now`
    pub fn due(community_id: impl Into<CommunityId>, now: DateTime<Utc>) -> Self {
        Self {
            community_id: Some(community_id.into()),
            status: Some(ActionRunStatus::Scheduled),
            due_before: Some(now),
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &ActionRun) -> bool {
        self.community_id
            .as_ref()
            .map_or(true, |c| *c == run.community_id)
            && self.status.map_or(true, |s| s == run.status)
            && self.pub_id.map_or(true, |p| Some(p) == run.pub_id)
            && self
                .action_instance_id
                .map_or(true, |i| i == run.action_instance_id)
            && self.automation_id.map_or(true, |a| Some(a) == run.automation_id)
            && self
                .due_before
                .map_or(true, |t| run.run_at.map_or(false, |at| at <= t))
    }
}

/// Persistence interface consumed by the engine
#[async_trait]
pub trait AutomationStorage: Send + Sync {
    // Stages and move constraints

    async fn create_stage(&self, stage: Stage) -> Result<Stage>;

    async fn get_stage(&self, id: &StageId) -> Result<Option<Stage>>;

    async fn list_stages(&self, community_id: &CommunityId) -> Result<Vec<Stage>>;

    /// Fails if either endpoint is unknown or the stages belong to different
    /// communities
    async fn create_move_constraint(&self, constraint: MoveConstraint) -> Result<MoveConstraint>;

    async fn list_move_constraints(&self, community_id: &CommunityId)
        -> Result<Vec<MoveConstraint>>;

    /// Stages and constraints of one community, as a queryable graph
    async fn load_stage_graph(&self, community_id: &CommunityId) -> Result<StageGraph> {
        let stages = self.list_stages(community_id).await?;
        let constraints = self.list_move_constraints(community_id).await?;
        Ok(StageGraph::new(community_id.clone(), stages, constraints))
    }

    // Action instances and automations

    async fn create_action_instance(&self, instance: ActionInstance) -> Result<ActionInstance>;

    async fn get_action_instance(&self, id: &ActionInstanceId) -> Result<Option<ActionInstance>>;

    async fn list_action_instances(&self, stage_id: &StageId) -> Result<Vec<ActionInstance>>;

    async fn create_automation(&self, automation: Automation) -> Result<Automation>;

    async fn get_automation(&self, id: &AutomationId) -> Result<Option<Automation>>;

    /// Automations whose action instance sits on `stage_id`, oldest first,
    /// optionally narrowed to one event kind
    async fn list_automations(
        &self,
        stage_id: &StageId,
        event: Option<AutomationEvent>,
    ) -> Result<Vec<Automation>>;

    // Pubs and the pub-in-stage relation

    async fn create_pub(&self, pub_item: PubSnapshot, stage_id: Option<StageId>)
        -> Result<PubSnapshot>;

    async fn get_pub(&self, id: &PubId) -> Result<Option<PubSnapshot>>;

    async fn get_pub_stage(&self, id: &PubId) -> Result<Option<StageId>>;

    /// Place the pub in `stage_id`, returning the stage it left
    async fn set_pub_stage(&self, id: &PubId, stage_id: StageId) -> Result<Option<StageId>>;

    // Action runs

    async fn create_action_run(&self, run: ActionRun) -> Result<ActionRun>;

    async fn get_action_run(&self, id: &ActionRunId) -> Result<Option<ActionRun>>;

    /// Overwrite a run that is not in a terminal status
    async fn update_action_run(&self, run: ActionRun) -> Result<ActionRun>;

    /// Replace the stored run with `next` only if its status is still
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_set_action_run(
        &self,
        expected: ActionRunStatus,
        next: ActionRun,
    ) -> Result<bool>;

    /// Insert a scheduled run unless one is already scheduled for the same
    /// pub and automation, in which case that one is returned instead
    async fn insert_scheduled_run(&self, run: ActionRun) -> Result<(ActionRun, bool)>;

    async fn list_action_runs(&self, filter: &RunFilter) -> Result<Vec<ActionRun>>;

    async fn list_due_runs(
        &self,
        community_id: &CommunityId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionRun>> {
        self.list_action_runs(&RunFilter::due(community_id.clone(), now))
            .await
    }
}

#[derive(Debug, Clone)]
struct PubRecord {
    snapshot: PubSnapshot,
    stage_id: Option<StageId>,
}

/// In-memory storage backend
///
/// Good for tests, development and the demo server. Nothing survives a
/// restart.
#[derive(Default)]
pub struct InMemoryStorage {
    stages: DashMap<StageId, Stage>,
    constraints: DashMap<(StageId, StageId), MoveConstraint>,
    instances: DashMap<ActionInstanceId, ActionInstance>,
    automations: DashMap<AutomationId, Automation>,
    pubs: DashMap<PubId, PubRecord>,
    runs: DashMap<ActionRunId, ActionRun>,
    // Serializes the find-then-insert in insert_scheduled_run
    scheduling: tokio::sync::Mutex<()>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_runs(&self, filter: &RunFilter) -> Vec<ActionRun> {
        let mut runs: Vec<ActionRun> = self
            .runs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by_key(|run| (run.created_at, run.id));
        runs
    }
}

#[async_trait]
impl AutomationStorage for InMemoryStorage {
    async fn create_stage(&self, stage: Stage) -> Result<Stage> {
        self.stages.insert(stage.id.clone(), stage.clone());
        Ok(stage)
    }

    async fn get_stage(&self, id: &StageId) -> Result<Option<Stage>> {
        Ok(self.stages.get(id).map(|s| s.value().clone()))
    }

    async fn list_stages(&self, community_id: &CommunityId) -> Result<Vec<Stage>> {
        let mut stages: Vec<Stage> = self
            .stages
            .iter()
            .filter(|s| s.community_id == *community_id)
            .map(|s| s.value().clone())
            .collect();
        stages.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Ok(stages)
    }

    async fn create_move_constraint(&self, constraint: MoveConstraint) -> Result<MoveConstraint> {
        let from = self
            .get_stage(&constraint.stage_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("stage", &constraint.stage_id))?;
        let to = self
            .get_stage(&constraint.destination_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("stage", &constraint.destination_id))?;

        if from.community_id != to.community_id {
            return Err(PubflowError::InvalidInput(format!(
                "move constraint {} -> {} crosses communities",
                from.id, to.id
            )));
        }

        self.constraints.insert(
            (constraint.stage_id.clone(), constraint.destination_id.clone()),
            constraint.clone(),
        );
        Ok(constraint)
    }

    async fn list_move_constraints(
        &self,
        community_id: &CommunityId,
    ) -> Result<Vec<MoveConstraint>> {
        let mut constraints: Vec<MoveConstraint> = self
            .constraints
            .iter()
            .filter(|c| {
                self.stages
                    .get(&c.stage_id)
                    .map_or(false, |s| s.community_id == *community_id)
            })
            .map(|c| c.value().clone())
            .collect();
        constraints.sort_by(|a, b| {
            (&a.stage_id, &a.destination_id).cmp(&(&b.stage_id, &b.destination_id))
        });
        Ok(constraints)
    }

    async fn create_action_instance(&self, instance: ActionInstance) -> Result<ActionInstance> {
        let stage = self
            .get_stage(&instance.stage_id)
            .await?
            .ok_or_else(|| PubflowError::not_found("stage", &instance.stage_id))?;
        if stage.community_id != instance.community_id {
            return Err(PubflowError::InvalidInput(format!(
                "stage {} does not belong to community {}",
                stage.id, instance.community_id
            )));
        }
        self.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_action_instance(&self, id: &ActionInstanceId) -> Result<Option<ActionInstance>> {
        Ok(self.instances.get(id).map(|i| i.value().clone()))
    }

    async fn list_action_instances(&self, stage_id: &StageId) -> Result<Vec<ActionInstance>> {
        let mut instances: Vec<ActionInstance> = self
            .instances
            .iter()
            .filter(|i| i.stage_id == *stage_id)
            .map(|i| i.value().clone())
            .collect();
        instances.sort_by_key(|i| (i.created_at, i.id));
        Ok(instances)
    }

    async fn create_automation(&self, automation: Automation) -> Result<Automation> {
        if !self.instances.contains_key(&automation.action_instance_id) {
            return Err(PubflowError::not_found(
                "action instance",
                automation.action_instance_id,
            ));
        }
        self.automations.insert(automation.id, automation.clone());
        Ok(automation)
    }

    async fn get_automation(&self, id: &AutomationId) -> Result<Option<Automation>> {
        Ok(self.automations.get(id).map(|a| a.value().clone()))
    }

    async fn list_automations(
        &self,
        stage_id: &StageId,
        event: Option<AutomationEvent>,
    ) -> Result<Vec<Automation>> {
        let mut automations: Vec<Automation> = self
            .automations
            .iter()
            .filter(|a| event.map_or(true, |e| e == a.event))
            .filter(|a| {
                self.instances
                    .get(&a.action_instance_id)
                    .map_or(false, |i| i.stage_id == *stage_id)
            })
            .map(|a| a.value().clone())
            .collect();
        automations.sort_by_key(|a| (a.created_at, a.id));
        Ok(automations)
    }

    async fn create_pub(
        &self,
        pub_item: PubSnapshot,
        stage_id: Option<StageId>,
    ) -> Result<PubSnapshot> {
        self.pubs.insert(
            pub_item.id,
            PubRecord {
                snapshot: pub_item.clone(),
                stage_id,
            },
        );
        Ok(pub_item)
    }

    async fn get_pub(&self, id: &PubId) -> Result<Option<PubSnapshot>> {
        Ok(self.pubs.get(id).map(|p| p.snapshot.clone()))
    }

    async fn get_pub_stage(&self, id: &PubId) -> Result<Option<StageId>> {
        Ok(self.pubs.get(id).and_then(|p| p.stage_id.clone()))
    }

    async fn set_pub_stage(&self, id: &PubId, stage_id: StageId) -> Result<Option<StageId>> {
        let mut record = self
            .pubs
            .get_mut(id)
            .ok_or_else(|| PubflowError::not_found("pub", id))?;
        Ok(record.stage_id.replace(stage_id))
    }

    async fn create_action_run(&self, run: ActionRun) -> Result<ActionRun> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Err(PubflowError::InvalidState(format!(
                "action run {} already exists",
                run.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(run)
            }
        }
    }

    async fn get_action_run(&self, id: &ActionRunId) -> Result<Option<ActionRun>> {
        Ok(self.runs.get(id).map(|r| r.value().clone()))
    }

    async fn update_action_run(&self, run: ActionRun) -> Result<ActionRun> {
        let mut stored = self
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| PubflowError::not_found("action run", run.id))?;
        if stored.status.is_terminal() {
            return Err(PubflowError::InvalidState(format!(
                "action run {} is already {}",
                run.id, stored.status
            )));
        }
        *stored = run.clone();
        Ok(run)
    }

    async fn compare_and_set_action_run(
        &self,
        expected: ActionRunStatus,
        next: ActionRun,
    ) -> Result<bool> {
        if !expected.can_transition_to(next.status) {
            return Err(PubflowError::InvalidState(format!(
                "cannot move action run {} from {} to {}",
                next.id, expected, next.status
            )));
        }

        let mut stored = self
            .runs
            .get_mut(&next.id)
            .ok_or_else(|| PubflowError::not_found("action run", next.id))?;
        if stored.status != expected {
            return Ok(false);
        }
        *stored = next;
        Ok(true)
    }

    async fn insert_scheduled_run(&self, run: ActionRun) -> Result<(ActionRun, bool)> {
        let _guard = self.scheduling.lock().await;

        let existing = self
            .runs
            .iter()
            .find(|r| {
                r.status == ActionRunStatus::Scheduled
                    && r.pub_id == run.pub_id
                    && r.automation_id == run.automation_id
            })
            .map(|r| r.value().clone());

        match existing {
            Some(existing) => Ok((existing, false)),
            None => Ok((self.create_action_run(run).await?, true)),
        }
    }

    async fn list_action_runs(&self, filter: &RunFilter) -> Result<Vec<ActionRun>> {
        Ok(self.sorted_runs(filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AutomationConfig, AutomationEvent};
    use serde_json::json;

    async fn seeded() -> (InMemoryStorage, ActionInstance) {
        let storage = InMemoryStorage::new();
        storage
            .create_stage(Stage::new("submitted", "Submitted", 0, "journal"))
            .await
            .unwrap();
        storage
            .create_stage(Stage::new("review", "Under Review", 1, "journal"))
            .await
            .unwrap();
        storage
            .create_stage(Stage::new("elsewhere", "Elsewhere", 0, "other"))
            .await
            .unwrap();
        let instance = storage
            .create_action_instance(ActionInstance::new(
                "Log",
                "log",
                "review",
                "journal",
                json!({}),
            ))
            .await
            .unwrap();
        (storage, instance)
    }

    #[tokio::test]
    async fn test_move_constraints_stay_within_community() {
        let (storage, _) = seeded().await;

        storage
            .create_move_constraint(MoveConstraint::new("submitted", "review"))
            .await
            .unwrap();
        let err = storage
            .create_move_constraint(MoveConstraint::new("submitted", "elsewhere"))
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::InvalidInput(_)));

        let graph = storage
            .load_stage_graph(&CommunityId::from("journal"))
            .await
            .unwrap();
        assert!(graph.is_legal_move(&"submitted".into(), &"review".into()));
        assert_eq!(graph.stages().len(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_set_only_swaps_matching_status() {
        let (storage, instance) = seeded().await;
        let pub_id = PubId::new();
        let scheduled = ActionRun::scheduled(
            &instance,
            pub_id,
            AutomationId::new(),
            Utc::now(),
            vec![],
        );
        storage.create_action_run(scheduled.clone()).await.unwrap();

        let mut claimed = scheduled.clone();
        claimed.status = ActionRunStatus::Running;
        assert!(storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, claimed.clone())
            .await
            .unwrap());
        // A second claimer loses
        assert!(!storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, claimed)
            .await
            .unwrap());

        let mut cancelled = scheduled;
        cancelled.cancel("too late");
        assert!(!storage
            .compare_and_set_action_run(ActionRunStatus::Scheduled, cancelled)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_backward_transition() {
        let (storage, instance) = seeded().await;
        let mut run = ActionRun::running(&instance, None, AutomationEvent::Webhook, vec![]);
        storage.create_action_run(run.clone()).await.unwrap();
        run.status = ActionRunStatus::Scheduled;
        let err = storage
            .compare_and_set_action_run(ActionRunStatus::Running, run)
            .await
            .unwrap_err();
        assert!(matches!(err, PubflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_terminal_runs_are_not_reopened() {
        let (storage, instance) = seeded().await;
        let mut run = ActionRun::running(&instance, None, AutomationEvent::Webhook, vec![]);
        storage.create_action_run(run.clone()).await.unwrap();
        run.succeed(json!({ "ok": true }));
        storage.update_action_run(run.clone()).await.unwrap();

        let err = storage.update_action_run(run).await.unwrap_err();
        assert!(matches!(err, PubflowError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_insert_scheduled_run_returns_existing() {
        let (storage, instance) = seeded().await;
        let pub_id = PubId::new();
        let automation_id = AutomationId::new();
        let first = ActionRun::scheduled(&instance, pub_id, automation_id, Utc::now(), vec![]);
        let second = ActionRun::scheduled(&instance, pub_id, automation_id, Utc::now(), vec![]);

        let (stored, created) = storage.insert_scheduled_run(first.clone()).await.unwrap();
        assert!(created);
        assert_eq!(stored.id, first.id);

        let (stored, created) = storage.insert_scheduled_run(second).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);
        assert_eq!(
            storage.list_action_runs(&RunFilter::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_list_automations_by_stage_and_event() {
        let (storage, instance) = seeded().await;
        storage
            .create_automation(Automation::new(
                AutomationEvent::PubEnteredStage,
                instance.id,
                AutomationConfig::Empty,
            ))
            .await
            .unwrap();
        storage
            .create_automation(Automation::new(
                AutomationEvent::Webhook,
                instance.id,
                AutomationConfig::Empty,
            ))
            .await
            .unwrap();

        let review = StageId::from("review");
        assert_eq!(storage.list_automations(&review, None).await.unwrap().len(), 2);
        assert_eq!(
            storage
                .list_automations(&review, Some(AutomationEvent::Webhook))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(storage
            .list_automations(&"submitted".into(), None)
            .await
            .unwrap()
            .is_empty());

        let missing = Automation::new(
            AutomationEvent::Webhook,
            ActionInstanceId::new(),
            AutomationConfig::Empty,
        );
        assert!(matches!(
            storage.create_automation(missing).await,
            Err(PubflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_due_runs_filter() {
        let (storage, instance) = seeded().await;
        let now = Utc::now();
        let due = ActionRun::scheduled(
            &instance,
            PubId::new(),
            AutomationId::new(),
            now - chrono::Duration::minutes(1),
            vec![],
        );
        let later = ActionRun::scheduled(
            &instance,
            PubId::new(),
            AutomationId::new(),
            now + chrono::Duration::days(1),
            vec![],
        );
        storage.create_action_run(due.clone()).await.unwrap();
        storage.create_action_run(later).await.unwrap();

        let runs = storage
            .list_due_runs(&CommunityId::from("journal"), now)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, due.id);
    }

    #[tokio::test]
    async fn test_set_pub_stage_returns_previous() {
        let (storage, _) = seeded().await;
        let pub_item = storage
            .create_pub(PubSnapshot::new("journal"), Some("submitted".into()))
            .await
            .unwrap();

        let previous = storage
            .set_pub_stage(&pub_item.id, "review".into())
            .await
            .unwrap();
        assert_eq!(previous, Some(StageId::from("submitted")));
        assert_eq!(
            storage.get_pub_stage(&pub_item.id).await.unwrap(),
            Some(StageId::from("review"))
        );
        assert!(storage.set_pub_stage(&PubId::new(), "review".into()).await.is_err());
    }
}
