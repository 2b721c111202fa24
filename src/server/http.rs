// HTTP routes and handlers
// RPC API under /api/v0/c/:community_id, public webhook under /c/:community_slug

//! # HTTP API
//!
//! Authenticated RPC routes, all scoped to a community:
//!
//! ```text
//! POST /api/v0/c/:community_id/automations/:automation_id/run
//! POST /api/v0/c/:community_id/automations/:automation_id/schedule-delayed
//! POST /api/v0/c/:community_id/automations/:automation_id/run-delayed
//! POST /api/v0/c/:community_id/automations/:automation_id/run-webhook
//! POST /api/v0/c/:community_id/action-runs/:action_run_id/cancel
//! GET  /api/v0/c/:community_id/action-runs
//! GET  /api/v0/c/:community_id/action-runs/stream
//! GET  /api/v0/c/:community_id/action-runs/:action_run_id
//! GET  /api/v0/c/:community_id/stages/:stage_id/automations
//! POST /api/v0/c/:community_id/stages/:stage_id/automations
//! POST /api/v0/c/:community_id/pubs/:pub_id/move
//! ```
//!
//! Unauthenticated:
//!
//! ```text
//! GET|POST /c/:community_slug/site/webhook/:automation_id
//! GET      /health
//! ```

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use super::auth::require_bearer;
use super::AppState;
use crate::engine::MoveOutcome;
use crate::models::{
    ActionInstanceId, ActionRun, ActionRunId, ActionRunResult, ActionRunStatus, Automation,
    AutomationEvent, AutomationId, CommunityId, PubId, StageId,
};
use crate::{NotificationFilter, PubflowError, Result, RunFilter, RunStack};

/// The public URL integrators call to fire a webhook automation
pub fn webhook_path(community_id: &CommunityId, automation_id: &AutomationId) -> String {
    format!(
        "/c/{}/site/webhook/{}",
        urlencoding::encode(community_id.as_str()),
        automation_id
    )
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/v0/c/:community_id/automations/:automation_id/run",
            post(run_automation),
        )
        .route(
            "/api/v0/c/:community_id/automations/:automation_id/schedule-delayed",
            post(schedule_delayed_automation),
        )
        .route(
            "/api/v0/c/:community_id/automations/:automation_id/run-delayed",
            post(run_delayed_automation),
        )
        .route(
            "/api/v0/c/:community_id/automations/:automation_id/run-webhook",
            post(run_webhook_automation),
        )
        .route(
            "/api/v0/c/:community_id/action-runs/:action_run_id/cancel",
            post(cancel_scheduled_automation),
        )
        .route("/api/v0/c/:community_id/action-runs", get(list_action_runs))
        .route(
            "/api/v0/c/:community_id/action-runs/stream",
            get(stream_action_runs),
        )
        .route(
            "/api/v0/c/:community_id/action-runs/:action_run_id",
            get(get_action_run),
        )
        .route(
            "/api/v0/c/:community_id/stages/:stage_id/automations",
            get(list_stage_automations).post(create_stage_automation),
        )
        .route("/api/v0/c/:community_id/pubs/:pub_id/move", post(move_pub))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .merge(api)
        .route(
            "/c/:community_slug/site/webhook/:automation_id",
            get(inbound_webhook_get).post(inbound_webhook_post),
        )
        .route("/health", get(health_check))
        .with_state(state)
}

// Request and response bodies

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAutomationRequest {
    pub pub_id: Option<PubId>,
    pub event: Option<AutomationEvent>,
    #[serde(default)]
    pub stack: RunStack,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAutomationResponse {
    pub automation_id: AutomationId,
    pub action_instance_id: ActionInstanceId,
    pub result: ActionRunResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDelayedRequest {
    pub pub_id: PubId,
    #[serde(default)]
    pub stack: RunStack,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDelayedResponse {
    pub automation_id: AutomationId,
    pub action_instance_name: String,
    pub action_run_id: ActionRunId,
    pub run_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDelayedRequest {
    pub pub_id: Option<PubId>,
    pub event: Option<AutomationEvent>,
    pub action_run_id: ActionRunId,
    #[serde(default)]
    pub stack: RunStack,
    pub config: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RunWebhookRequest {
    #[serde(default)]
    pub json: Value,
    #[serde(default)]
    pub stack: RunStack,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResultResponse {
    pub automation_id: AutomationId,
    pub result: ActionRunResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAutomationRequest {
    pub event: AutomationEvent,
    pub action_instance_id: ActionInstanceId,
    pub config: Option<Value>,
    pub source_action_instance_id: Option<ActionInstanceId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAutomation {
    #[serde(flatten)]
    pub automation: Automation,
    pub action_instance_name: String,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePubRequest {
    pub stage_id: StageId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunQuery {
    pub status: Option<ActionRunStatus>,
    pub pub_id: Option<PubId>,
    #[serde(default)]
    pub due: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub action_instance_id: Option<ActionInstanceId>,
    pub action_run_id: Option<ActionRunId>,
}

// Handlers

async fn run_automation(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    Json(request): Json<RunAutomationRequest>,
) -> Result<Json<RunAutomationResponse>> {
    let (automation, result) = state
        .engine
        .run_automation(
            &community_id,
            &automation_id,
            request.pub_id,
            request.event,
            request.stack,
        )
        .await?;
    Ok(Json(RunAutomationResponse {
        automation_id: automation.id,
        action_instance_id: automation.action_instance_id,
        result,
    }))
}

async fn schedule_delayed_automation(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    Json(request): Json<ScheduleDelayedRequest>,
) -> Result<Json<ScheduleDelayedResponse>> {
    state
        .engine
        .community_automation(&community_id, &automation_id)
        .await?;
    let scheduled = state
        .engine
        .scheduler()
        .schedule_automation(&automation_id, request.pub_id, request.stack)
        .await?;
    Ok(Json(ScheduleDelayedResponse {
        automation_id,
        action_instance_name: scheduled.action_instance_name,
        action_run_id: scheduled.action_run_id,
        run_at: scheduled.run_at,
    }))
}

async fn run_delayed_automation(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    Json(request): Json<RunDelayedRequest>,
) -> Result<Json<AutomationResultResponse>> {
    let run = community_run(&state, &community_id, &request.action_run_id).await?;
    if run.automation_id != Some(automation_id) {
        return Err(PubflowError::InvalidInput(format!(
            "action run {} was not scheduled by automation {}",
            run.id, automation_id
        )));
    }
    if request.pub_id.is_some() && request.pub_id != run.pub_id {
        return Err(PubflowError::InvalidInput(format!(
            "action run {} belongs to a different pub",
            run.id
        )));
    }
    if request.event.map_or(false, |event| event != run.event) {
        return Err(PubflowError::InvalidInput(format!(
            "action run {} was scheduled for '{}'",
            run.id, run.event
        )));
    }
    if !request.stack.is_empty() && request.stack.ids() != run.stack.as_slice() {
        return Err(PubflowError::InvalidInput(format!(
            "stack does not match the one persisted on action run {}",
            run.id
        )));
    }

    let result = state
        .engine
        .delayed()
        .run_delayed_automation(&run.id, request.config)
        .await?;
    Ok(Json(AutomationResultResponse {
        automation_id,
        result,
    }))
}

async fn run_webhook_automation(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    Json(request): Json<RunWebhookRequest>,
) -> Result<Json<AutomationResultResponse>> {
    let (automation, result) = state
        .engine
        .run_webhook(&community_id, &automation_id, request.json, request.stack)
        .await?;
    Ok(Json(AutomationResultResponse {
        automation_id: automation.id,
        result,
    }))
}

async fn cancel_scheduled_automation(
    State(state): State<AppState>,
    Path((community_id, action_run_id)): Path<(CommunityId, ActionRunId)>,
) -> Result<Json<Value>> {
    community_run(&state, &community_id, &action_run_id).await?;
    state
        .engine
        .delayed()
        .cancel_scheduled_automation(&action_run_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_action_run(
    State(state): State<AppState>,
    Path((community_id, action_run_id)): Path<(CommunityId, ActionRunId)>,
) -> Result<Json<ActionRun>> {
    Ok(Json(
        community_run(&state, &community_id, &action_run_id).await?,
    ))
}

async fn list_action_runs(
    State(state): State<AppState>,
    Path(community_id): Path<CommunityId>,
    Query(query): Query<ActionRunQuery>,
) -> Result<Json<Vec<ActionRun>>> {
    let mut filter = if query.due {
        RunFilter::due(community_id, state.engine.now())
    } else {
        RunFilter::community(community_id)
    };
    if !query.due {
        filter.status = query.status;
    }
    filter.pub_id = query.pub_id;

    Ok(Json(state.engine.storage().list_action_runs(&filter).await?))
}

async fn stream_action_runs(
    State(state): State<AppState>,
    Path(community_id): Path<CommunityId>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    info!(community = %community_id, "🌊 action run stream opened");
    let filter = NotificationFilter::community(community_id)
        .with_action_instance(query.action_instance_id)
        .with_action_run(query.action_run_id);

    let receiver = state.engine.notifications().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |message| {
        let filter = filter.clone();
        async move {
            match message {
                Ok(notification) if filter.matches(&notification) => Event::default()
                    .event(notification.status.as_str())
                    .json_data(&notification)
                    .ok()
                    .map(Ok),
                // Lagged receivers skip ahead; the run record stays authoritative
                _ => None,
            }
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn list_stage_automations(
    State(state): State<AppState>,
    Path((community_id, stage_id)): Path<(CommunityId, StageId)>,
) -> Result<Json<Vec<StageAutomation>>> {
    community_stage(&state, &community_id, &stage_id).await?;
    let storage = state.engine.storage();
    let automations = storage.list_automations(&stage_id, None).await?;

    let mut listed = Vec::with_capacity(automations.len());
    for automation in automations {
        let action_instance_name = storage
            .get_action_instance(&automation.action_instance_id)
            .await?
            .map(|instance| instance.name)
            .unwrap_or_default();
        let webhook_url = (automation.event == AutomationEvent::Webhook)
            .then(|| webhook_path(&community_id, &automation.id));
        listed.push(StageAutomation {
            automation,
            action_instance_name,
            webhook_url,
        });
    }
    Ok(Json(listed))
}

async fn create_stage_automation(
    State(state): State<AppState>,
    Path((community_id, stage_id)): Path<(CommunityId, StageId)>,
    Json(request): Json<CreateAutomationRequest>,
) -> Result<impl IntoResponse> {
    community_stage(&state, &community_id, &stage_id).await?;
    let instance = state
        .engine
        .storage()
        .get_action_instance(&request.action_instance_id)
        .await?
        .filter(|instance| instance.stage_id == stage_id)
        .ok_or_else(|| PubflowError::not_found("action instance", request.action_instance_id))?;

    let automation = state
        .engine
        .create_automation(
            request.event,
            instance.id,
            request.config.as_ref(),
            request.source_action_instance_id,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(automation)))
}

async fn move_pub(
    State(state): State<AppState>,
    Path((community_id, pub_id)): Path<(CommunityId, PubId)>,
    Json(request): Json<MovePubRequest>,
) -> Result<Json<MoveOutcome>> {
    let pub_item = state
        .engine
        .storage()
        .get_pub(&pub_id)
        .await?
        .filter(|p| p.community_id == community_id)
        .ok_or_else(|| PubflowError::not_found("pub", pub_id))?;
    Ok(Json(
        state.engine.move_pub(&pub_item.id, &request.stage_id).await?,
    ))
}

async fn inbound_webhook_post(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    body: Bytes,
) -> Result<Json<AutomationResultResponse>> {
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PubflowError::InvalidInput(format!("webhook body is not JSON: {}", e)))?
    };
    inbound_webhook(state, community_id, automation_id, json).await
}

async fn inbound_webhook_get(
    State(state): State<AppState>,
    Path((community_id, automation_id)): Path<(CommunityId, AutomationId)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<AutomationResultResponse>> {
    inbound_webhook(state, community_id, automation_id, json!(params)).await
}

async fn inbound_webhook(
    state: AppState,
    community_id: CommunityId,
    automation_id: AutomationId,
    json: Value,
) -> Result<Json<AutomationResultResponse>> {
    info!(community = %community_id, automation_id = %automation_id, "🪝 inbound webhook");
    let (automation, result) = state
        .engine
        .run_webhook(&community_id, &automation_id, json, RunStack::new())
        .await?;
    Ok(Json(AutomationResultResponse {
        automation_id: automation.id,
        result,
    }))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "pubflow" }))
}

async fn community_run(
    state: &AppState,
    community_id: &CommunityId,
    action_run_id: &ActionRunId,
) -> Result<ActionRun> {
    state
        .engine
        .storage()
        .get_action_run(action_run_id)
        .await?
        .filter(|run| run.community_id == *community_id)
        .ok_or_else(|| PubflowError::not_found("action run", action_run_id))
}

async fn community_stage(
    state: &AppState,
    community_id: &CommunityId,
    stage_id: &StageId,
) -> Result<()> {
    state
        .engine
        .storage()
        .get_stage(stage_id)
        .await?
        .filter(|stage| stage.community_id == *community_id)
        .map(|_| ())
        .ok_or_else(|| PubflowError::not_found("stage", stage_id))
}
