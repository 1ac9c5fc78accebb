use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tome_core::events::RunEvent;

use crate::event_bridge::{self, EventHub};
use crate::handlers::{self, HandlerState};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    /// Finished runs whose events stay available for replay.
    pub retained_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9092,
            retained_runs: 64,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub hub: Arc<EventHub>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/jobs", get(handlers::list_jobs).post(handlers::save_job))
        .route("/jobs/import", post(handlers::import_job))
        .route("/jobs/{id}", get(handlers::get_job).delete(handlers::delete_job))
        .route("/jobs/{id}/run", post(handlers::start_run))
        .route("/jobs/{id}/runs", get(handlers::list_runs))
        .route("/jobs/{id}/history", get(handlers::list_history))
        .route("/jobs/{id}/history/delete", post(handlers::delete_history))
        .route("/jobs/{id}/history/{filename}", get(handlers::read_history))
        .route("/runs/{token}/events", get(handlers::run_events))
        .route("/runs/{token}/cancel", post(handlers::cancel_run))
        .route("/runs/{token}/logs", get(handlers::run_logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    handler_state: HandlerState,
    event_tx: &broadcast::Sender<RunEvent>,
) -> Result<ServerHandle, std::io::Error> {
    let hub = Arc::new(EventHub::new(config.retained_runs));
    let bridge_handle = event_bridge::create_bridge(Arc::clone(&hub), event_tx.subscribe());

    let app_state = AppState {
        handler_state: Arc::new(handler_state),
        hub,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "tome server started");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}
