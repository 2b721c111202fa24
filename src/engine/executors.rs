// Action executors - where an action instance actually does its work

//! # Action Executors
//!
//! The engine treats action kinds as opaque. It hands an [`ActionRequest`]
//! to an [`ActionExecutor`] and records whatever comes back: a JSON result
//! on success, an error message on failure.
//!
//! [`ActionKindRegistry`] is the default executor. It routes each request to
//! the [`ActionHandler`] registered for the instance's kind. Two kinds ship
//! built in:
//!
//! - `log`: writes the request to the tracing log and echoes its config
//! - `http`: POSTs the request as JSON to `config.url` and returns the
//!   response body

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::models::{ActionKind, ActionRunId, AutomationEvent, PubSnapshot};

/// Everything an executor gets to see about one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action_run_id: ActionRunId,
    pub action: ActionKind,
    /// Instance config with any per-run override applied
    pub config: Value,
    /// `None` for runs not tied to a pub
    pub pub_snapshot: Option<PubSnapshot>,
    pub event: AutomationEvent,
    /// Event data: webhook body, the triggering run's outcome, ...
    pub params: Value,
}

/// The opaque execution collaborator
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value>;
}

/// Executes one action kind
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: &ActionRequest) -> anyhow::Result<Value>;
}

/// Routes requests to handlers by action kind
#[derive(Clone, Default)]
pub struct ActionKindRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionKindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `log` and `http` kinds
    pub fn with_builtin(http_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register("log", Arc::new(LogAction));
        registry.register("http", Arc::new(HttpAction::new(http_timeout)));
        registry
    }

    pub fn register(&mut self, kind: impl Into<ActionKind>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn kinds(&self) -> Vec<&ActionKind> {
        let mut kinds: Vec<&ActionKind> = self.handlers.keys().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }
}

#[async_trait]
impl ActionExecutor for ActionKindRegistry {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value> {
        let handler = self
            .handlers
            .get(&request.action)
            .ok_or_else(|| anyhow::anyhow!("no executor registered for action '{}'", request.action))?;
        debug!(action = %request.action, action_run_id = %request.action_run_id, "executing action");
        handler.handle(&request).await
    }
}

/// `log`: record the run in the tracing log
pub struct LogAction;

#[async_trait]
impl ActionHandler for LogAction {
    async fn handle(&self, request: &ActionRequest) -> anyhow::Result<Value> {
        let message = request
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("action run");
        info!(
            action_run_id = %request.action_run_id,
            event = %request.event,
            pub_id = ?request.pub_snapshot.as_ref().map(|p| p.id),
            "📝 {}",
            message
        );
        Ok(json!({ "logged": message, "config": request.config }))
    }
}

/// `http`: POST the request to `config.url`
pub struct HttpAction {
    client: reqwest::Client,
}

impl HttpAction {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for HttpAction {
    async fn handle(&self, request: &ActionRequest) -> anyhow::Result<Value> {
        let url = request
            .config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("http action requires a 'url' in its config"))?;

        let response = self.client.post(url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            anyhow::bail!("{} responded with {}: {}", url, status, body);
        }

        let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: &str, config: Value) -> ActionRequest {
        ActionRequest {
            action_run_id: ActionRunId::new(),
            action: ActionKind::from(kind),
            config,
            pub_snapshot: None,
            event: AutomationEvent::Webhook,
            params: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_log_action_echoes_config() {
        let registry = ActionKindRegistry::with_builtin(Duration::from_secs(1));
        let result = registry
            .execute(request("log", json!({ "message": "hello" })))
            .await
            .unwrap();
        assert_eq!(result["logged"], "hello");
        assert_eq!(result["config"]["message"], "hello");
    }

    #[tokio::test]
    async fn test_unknown_kind_is_an_error() {
        let registry = ActionKindRegistry::with_builtin(Duration::from_secs(1));
        let err = registry.execute(request("fax", json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("fax"));
    }

    #[tokio::test]
    async fn test_http_action_requires_url() {
        let registry = ActionKindRegistry::with_builtin(Duration::from_secs(1));
        let err = registry.execute(request("http", json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("url"));
        assert_eq!(registry.kinds().len(), 2);
    }
}
