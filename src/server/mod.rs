// pubflow HTTP server
// Exposes the automation engine over an authenticated RPC API

//! # Server Module
//!
//! ```text
//! Client (CMS, cron, integrator)
//!        ↓ HTTP (bearer auth) / webhook / SSE
//! Server Layer (this module)
//!        ↓ function calls
//! AutomationEngine ← dispatcher, scheduler, delayed runner
//!        ↓
//! AutomationStorage + ActionExecutor
//! ```
//!
//! Build and start a server with [`PubflowServerBuilder`]:
//!
//! ```rust,no_run
//! # async fn start() -> anyhow::Result<()> {
//! use pubflow::{PubflowServerBuilder, ServerConfig};
//!
//! PubflowServerBuilder::new()
//!     .with_config(ServerConfig::load()?)
//!     .build_and_run()
//!     .await
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod http;

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::engine::clock::SystemClock;
use crate::engine::executors::{ActionExecutor, ActionKindRegistry};
use crate::engine::storage::{AutomationStorage, InMemoryStorage};
use crate::engine::AutomationEngine;
use crate::models::{
    ActionInstance, AutomationEvent, CommunityId, MoveConstraint, PubSnapshot, Stage,
};
use crate::Result;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: AutomationEngine,
    pub config: Arc<ServerConfig>,
}

pub struct PubflowServer {
    config: ServerConfig,
    engine: AutomationEngine,
}

impl PubflowServer {
    pub fn engine(&self) -> &AutomationEngine {
        &self.engine
    }

    pub fn router(&self) -> axum::Router {
        let app = http::router(AppState {
            engine: self.engine.clone(),
            config: Arc::new(self.config.clone()),
        });
        if self.config.cors_enabled {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if self.config.seed_demo {
            seed_demo(&self.engine).await?;
        }

        let addr: SocketAddr = self.config.bind_address().parse()?;
        if self.config.auth_enabled() {
            info!("🔐 bearer auth enabled ({} tokens)", self.config.api_tokens.len());
        } else {
            info!("🔓 bearer auth disabled, no API tokens configured");
        }
        info!("🚀 pubflow server running on http://{}", addr);
        info!("🔗 RPC API: http://{}/api/v0/c/:community_id/...", addr);
        info!("🪝 Webhooks: http://{}/c/:community_slug/site/webhook/:automation_id", addr);

        axum::Server::bind(&addr)
            .serve(self.router().into_make_service())
            .await?;
        Ok(())
    }
}

pub struct PubflowServerBuilder {
    config: ServerConfig,
    storage: Option<Arc<dyn AutomationStorage>>,
    executor: Option<Arc<dyn ActionExecutor>>,
}

impl PubflowServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            storage: None,
            executor: None,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn AutomationStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> PubflowServer {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(ActionKindRegistry::with_builtin(
                self.config.http_action_timeout(),
            ))
        });
        let engine = AutomationEngine::new(
            storage,
            executor,
            Arc::new(SystemClock),
            self.config.engine(),
        );
        PubflowServer {
            config: self.config,
            engine,
        }
    }

    pub async fn build_and_run(self) -> anyhow::Result<()> {
        self.build().run().await
    }
}

impl Default for PubflowServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed a `demo` community: Submitted -> Under Evaluation -> Accepted | Rejected
///
/// Every automation uses the `log` action kind so the demo needs no
/// external services.
pub async fn seed_demo(engine: &AutomationEngine) -> Result<()> {
    let storage = engine.storage();
    let community = CommunityId::from("demo");

    let stages = [
        ("submitted", "Submitted"),
        ("under-evaluation", "Under Evaluation"),
        ("accepted", "Accepted"),
        ("rejected", "Rejected"),
    ];
    for (order, (id, name)) in stages.iter().enumerate() {
        storage
            .create_stage(Stage::new(*id, *name, order as u32, community.clone()))
            .await?;
    }
    for (from, to) in [
        ("submitted", "under-evaluation"),
        ("under-evaluation", "accepted"),
        ("under-evaluation", "rejected"),
    ] {
        storage
            .create_move_constraint(MoveConstraint::new(from, to))
            .await?;
    }

    let acknowledge = storage
        .create_action_instance(ActionInstance::new(
            "Acknowledge submission",
            "log",
            "submitted",
            community.clone(),
            json!({ "message": "submission received" }),
        ))
        .await?;
    engine
        .create_automation(AutomationEvent::PubEnteredStage, acknowledge.id, None, None)
        .await?;

    let nudge = storage
        .create_action_instance(ActionInstance::new(
            "Nudge reviewers",
            "log",
            "under-evaluation",
            community.clone(),
            json!({ "message": "evaluation is overdue" }),
        ))
        .await?;
    engine
        .create_automation(
            AutomationEvent::PubInStageForDuration,
            nudge.id,
            Some(&json!({ "duration": 3, "interval": "day" })),
            None,
        )
        .await?;

    let publish = storage
        .create_action_instance(ActionInstance::new(
            "Publish",
            "log",
            "accepted",
            community.clone(),
            json!({ "message": "publishing" }),
        ))
        .await?;
    let announce = storage
        .create_action_instance(ActionInstance::new(
            "Announce",
            "log",
            "accepted",
            community.clone(),
            json!({ "message": "announcing publication" }),
        ))
        .await?;
    engine
        .create_automation(AutomationEvent::PubEnteredStage, publish.id, None, None)
        .await?;
    engine
        .create_automation(
            AutomationEvent::ActionSucceeded,
            announce.id,
            None,
            Some(publish.id),
        )
        .await?;
    let hook = engine
        .create_automation(AutomationEvent::Webhook, publish.id, None, None)
        .await?;

    let pub_item = storage
        .create_pub(
            PubSnapshot::new(community.clone()).with_value("title", json!("A Demo Manuscript")),
            None,
        )
        .await?;
    engine.move_pub(&pub_item.id, &"submitted".into()).await?;

    info!(
        community = %community,
        pub_id = %pub_item.id,
        webhook = %http::webhook_path(&community, &hook.id),
        "🌱 seeded demo community"
    );
    Ok(())
}
