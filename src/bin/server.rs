// pubflow server
// Run with: cargo run --bin server

use anyhow::Result;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pubflow::{PubflowServerBuilder, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let config = ServerConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting pubflow server...");
    info!("Server: {}", config.bind_address());
    info!("Max stack depth: {}", config.max_stack_depth);
    if config.seed_demo {
        info!("Seeding demo community");
    }

    PubflowServerBuilder::new()
        .with_config(config)
        .build_and_run()
        .await
}
