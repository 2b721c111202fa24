// Server configuration
// Defaults, overridden by PUBFLOW_* environment variables

//! # Configuration
//!
//! [`ServerConfig`] is assembled with the `config` crate: built-in defaults
//! first, then environment variables with the `PUBFLOW_` prefix. The
//! binaries call `dotenv()` before loading, so a local `.env` file works too.
//!
//! | Variable | Default |
//! |---|---|
//! | `PUBFLOW_HOST` | `0.0.0.0` |
//! | `PUBFLOW_PORT` | `4000` |
//! | `PUBFLOW_CORS_ENABLED` | `true` |
//! | `PUBFLOW_API_TOKENS` | empty (comma separated) |
//! | `PUBFLOW_MAX_STACK_DEPTH` | `10` |
//! | `PUBFLOW_NOTIFICATION_BUFFER` | `1000` |
//! | `PUBFLOW_HTTP_ACTION_TIMEOUT_SECS` | `30` |
//! | `PUBFLOW_LOG_LEVEL` | `info` |
//! | `PUBFLOW_SEED_DEMO` | `false` |

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::engine::EngineConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
    /// Bearer tokens accepted by the RPC API. Empty disables auth.
    #[serde(default)]
    pub api_tokens: Vec<String>,
    pub max_stack_depth: usize,
    pub notification_buffer: usize,
    pub http_action_timeout_secs: u64,
    pub log_level: String,
    pub seed_demo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors_enabled: true,
            api_tokens: Vec::new(),
            max_stack_depth: engine.max_stack_depth,
            notification_buffer: engine.notification_buffer,
            http_action_timeout_secs: 30,
            log_level: "info".to_string(),
            seed_demo: false,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PUBFLOW_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Environment::with_prefix("PUBFLOW"))
    }

    fn load_from(env: Environment) -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();
        Config::builder()
            .set_default("host", defaults.host)?
            .set_default("port", i64::from(defaults.port))?
            .set_default("cors_enabled", defaults.cors_enabled)?
            .set_default("api_tokens", Vec::<String>::new())?
            .set_default("max_stack_depth", defaults.max_stack_depth as i64)?
            .set_default("notification_buffer", defaults.notification_buffer as i64)?
            .set_default(
                "http_action_timeout_secs",
                defaults.http_action_timeout_secs as i64,
            )?
            .set_default("log_level", defaults.log_level)?
            .set_default("seed_demo", defaults.seed_demo)?
            .add_source(
                env.try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("api_tokens"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_stack_depth: self.max_stack_depth,
            notification_buffer: self.notification_buffer,
        }
    }

    pub fn http_action_timeout(&self) -> Duration {
        Duration::from_secs(self.http_action_timeout_secs)
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_tokens.is_empty()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
