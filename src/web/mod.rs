//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::service::{AggregateService, IngestService};

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub ingest: IngestService,
    pub aggregate: AggregateService,
}

/// Web server for the scout dashboard collector.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server, wiring the services to the store.
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let ingest = IngestService::new(store.clone(), config.api_key.clone(), config.retention);
        let aggregate = AggregateService::new(store.clone(), config.retention, config.read_timeout);

        Self {
            state: AppState {
                config,
                store,
                ingest,
                aggregate,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            // API endpoints
            .route(
                "/api/stats",
                get(handlers::handle_get_stats).post(handlers::handle_push_stats),
            )
            // Pages
            .route("/status", get(handlers::handle_status))
            // Static assets
            .route("/favicon.ico", get(handlers::handle_favicon))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Web server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        axum::serve(listener, self.routes()).await?;
        Ok(())
    }
}
