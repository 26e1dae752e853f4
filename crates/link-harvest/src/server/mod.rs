//! HTTP surface: the job API under `/api` plus liveness and readiness probes

pub mod routes;
pub mod state;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::HarvestConfig;
use crate::error::{Error, Result};
use state::{AppState, Readiness};

/// Serves the job API over one [`AppState`]
pub struct HarvestServer {
    state: AppState,
}

impl HarvestServer {
    /// Open storage, recover interrupted jobs and start the worker pool
    pub async fn new(config: HarvestConfig) -> Result<Self> {
        Ok(Self::with_state(AppState::new(config).await?))
    }

    pub fn with_state(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Probes at the root, job API under `/api`
    pub fn build_router(&self) -> Router {
        let max_upload_size = self.state.config().server.max_upload_size;

        Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness))
            .nest("/api", routes::api_routes(max_upload_size))
            .with_state(self.state.clone())
            // Applied bottom to top, CORS outermost
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn start(self) -> Result<()> {
        let addr = self.address()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("Failed to bind {}: {}", addr, e)))?;

        let processing = &self.state.config().processing;
        tracing::info!("link-harvest listening on http://{}", addr);
        tracing::info!(
            "{} workers, queue capacity {}, {:?} progress",
            processing.workers,
            processing.queue_capacity,
            processing.progress
        );

        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| Error::internal(format!("Server error: {}", e)))
    }

    /// Configured listen address
    pub fn address(&self) -> Result<SocketAddr> {
        let server = &self.state.config().server;
        format!("{}:{}", server.host, server.port)
            .parse()
            .map_err(|e| {
                Error::Config(format!(
                    "Invalid address {}:{}: {}",
                    server.host, server.port, e
                ))
            })
    }
}

async fn health_check() -> &'static str {
    "OK"
}

/// 200 while the job store answers and at least one worker is running
async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let readiness = state.readiness();
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}
