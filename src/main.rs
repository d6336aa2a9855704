//! Scout Dashboard - telemetry collector
//!
//! Accepts snapshots pushed by scout agents, keeps a bounded rolling view
//! per machine and serves the aggregate to the dashboard.

mod config;
mod db;
mod scheduler;
mod service;
mod web;

use config::ServerConfig;
use db::Store;
use scheduler::RetentionManager;
use web::Server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("scout_dashboard=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting scout dashboard on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    if cfg.api_key.is_none() {
        tracing::warn!("SCOUT_API_KEY is not set; all pushes will be rejected");
    }

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!(
        "Database initialized successfully ({} known machines)",
        store.get_machines()?.len()
    );

    // Start expiry purging
    let retention = RetentionManager::new(store.clone());
    retention.start().await;

    // Start web server
    let server = Server::new(cfg, store);
    let result = server.start().await;

    retention.stop().await;
    result
}
