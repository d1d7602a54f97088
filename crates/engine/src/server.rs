//! HTTP serving interface
//!
//! Read-only JSON endpoints over the shared state and the history store, plus
//! a cancel trigger for the dashboard.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state::{SharedState, StateSnapshot};
use crate::store::HistoryStore;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    Serve(std::io::Error),
}

/// Handles shared by every route.
#[derive(Debug, Clone)]
pub struct AppState {
    pub state: SharedState,
    pub history: HistoryStore,
}

/// GET /state
async fn get_state(State(app): State<AppState>) -> Json<StateSnapshot> {
    Json(app.state.snapshot().await)
}

/// GET /history
async fn get_history(State(app): State<AppState>) -> impl IntoResponse {
    match app.history.load().await {
        Ok(records) => (StatusCode::OK, Json(json!(records))),
        Err(e) => {
            error!(error = %e, "failed to read history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// POST /cancel
async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    if app.state.request_cancel().await {
        info!("cancellation requested over HTTP");
        (StatusCode::ACCEPTED, Json(json!({ "cancelled": true })))
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "cancelled": false, "reason": "no active run" })),
        )
    }
}

async fn health() -> &'static str {
    "ok"
}

pub fn create_router(app: AppState) -> Router {
    Router::new()
        .route("/state", get(get_state))
        .route("/history", get(get_history))
        .route("/cancel", post(post_cancel))
        .route("/health", get(health))
        .with_state(app)
}

pub fn parse_bind(bind: &str) -> Result<SocketAddr, ServerError> {
    bind.parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))
}

/// Bind the listener up front so address errors surface before a run starts.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve on an already bound listener until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "serving results");
    }
    axum::serve(listener, create_router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn run_server(
    addr: SocketAddr,
    app: AppState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    serve(bind(addr).await?, app, shutdown).await
}
