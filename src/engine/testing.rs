// Test fixtures shared by the engine's unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use super::clock::ManualClock;
use super::executors::{ActionExecutor, ActionRequest};
use super::storage::{AutomationStorage, InMemoryStorage};
use super::{AutomationEngine, EngineConfig};
use crate::models::automation::utc_datetime;
use crate::models::{
    ActionInstance, ActionInstanceId, Automation, AutomationEvent, CommunityId, MoveConstraint,
    PubId, PubSnapshot, Stage,
};

/// Records every request. Kind `fail` returns an error, kind `panic` panics,
/// everything else succeeds.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    calls: Mutex<Vec<ActionRequest>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<ActionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, kind: &str) -> Vec<ActionRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.action.as_str() == kind)
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value> {
        let kind = request.action.as_str().to_string();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request);
        }
        match kind.as_str() {
            "fail" => anyhow::bail!("executor refused"),
            "panic" => panic!("executor exploded"),
            _ => Ok(json!({ "ok": true, "kind": kind })),
        }
    }
}

/// A journal community: submitted -> under-evaluation -> accepted | rejected,
/// and rejected -> submitted for resubmission
pub(crate) struct Fixture {
    pub storage: Arc<InMemoryStorage>,
    pub executor: Arc<RecordingExecutor>,
    pub clock: Arc<ManualClock>,
    pub engine: AutomationEngine,
    pub community: CommunityId,
}

impl Fixture {
    pub async fn journal() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_max_depth(max_stack_depth: usize) -> Self {
        Self::with_config(EngineConfig {
            max_stack_depth,
            ..EngineConfig::default()
        })
        .await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let executor = Arc::new(RecordingExecutor::default());
        let clock = Arc::new(ManualClock::new(
            utc_datetime(2025, 6, 10, 9, 0).expect("valid fixture date"),
        ));
        let engine = AutomationEngine::new(storage.clone(), executor.clone(), clock.clone(), config);
        let community = CommunityId::from("journal");

        let stages = [
            ("submitted", "Submitted"),
            ("under-evaluation", "Under Evaluation"),
            ("accepted", "Accepted"),
            ("rejected", "Rejected"),
        ];
        for (order, (id, name)) in stages.iter().enumerate() {
            storage
                .create_stage(Stage::new(*id, *name, order as u32, community.clone()))
                .await
                .expect("stage");
        }
        for (from, to) in [
            ("submitted", "under-evaluation"),
            ("under-evaluation", "accepted"),
            ("under-evaluation", "rejected"),
            ("rejected", "submitted"),
        ] {
            storage
                .create_move_constraint(MoveConstraint::new(from, to))
                .await
                .expect("constraint");
        }

        Self {
            storage,
            executor,
            clock,
            engine,
            community,
        }
    }

    pub async fn instance(&self, name: &str, kind: &str, stage: &str) -> ActionInstance {
        self.storage
            .create_action_instance(ActionInstance::new(
                name,
                kind,
                stage,
                self.community.clone(),
                json!({ "subject": name }),
            ))
            .await
            .expect("action instance")
    }

    pub async fn automate(&self, event: AutomationEvent, instance: ActionInstanceId) -> Automation {
        self.engine
            .create_automation(event, instance, None, None)
            .await
            .expect("automation")
    }

    pub async fn automate_with(
        &self,
        event: AutomationEvent,
        instance: ActionInstanceId,
        config: Value,
    ) -> Automation {
        self.engine
            .create_automation(event, instance, Some(&config), None)
            .await
            .expect("automation")
    }

    pub async fn automate_watching(
        &self,
        event: AutomationEvent,
        instance: ActionInstanceId,
        source: ActionInstanceId,
    ) -> Automation {
        self.engine
            .create_automation(event, instance, None, Some(source))
            .await
            .expect("automation")
    }

    pub async fn pub_in(&self, stage: &str) -> PubId {
        self.storage
            .create_pub(
                PubSnapshot::new(self.community.clone()).with_value("title", json!("On Stages")),
                Some(stage.into()),
            )
            .await
            .expect("pub")
            .id
    }

    pub async fn unplaced_pub(&self) -> PubId {
        self.storage
            .create_pub(PubSnapshot::new(self.community.clone()), None)
            .await
            .expect("pub")
            .id
    }
}
