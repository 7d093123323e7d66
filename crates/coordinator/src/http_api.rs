//! HTTP status API
//!
//! Read-only endpoints for operators and the dashboard: liveness, node
//! status, and per-repo session progress (a stalled round shows up here as
//! `num_nodes_averaged < num_nodes_chosen` with an old `last_message_time`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use update_store::{CheckpointRecord, WriteStats};

use crate::middleware::MessageStats;
use crate::service::CloudNodeService;

/// Shared state for HTTP handlers
pub type AppState = Arc<CloudNodeService>;

/// Node status for API response
#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime: u64,
    pub version: String,
    pub repos: usize,
    pub registrations: usize,
    pub active_sessions: usize,
    pub writes: WriteStats,
    pub messages: HashMap<String, MessageStats>,
}

/// Error body for API response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the HTTP API router
pub fn create_router(service: Arc<CloudNodeService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .route("/api/repos/:repo_id/session", get(get_session))
        .route(
            "/api/repos/:repo_id/sessions/:session_id/checkpoints",
            get(get_checkpoints),
        )
        .layer(cors)
        .with_state(service)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// Get node status
async fn get_status(State(service): State<AppState>) -> impl IntoResponse {
    let registry = service.registry();
    let status = StatusResponse {
        uptime: service.uptime_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        repos: registry.repo_count(),
        registrations: registry.registration_count(),
        active_sessions: service.active_sessions(),
        writes: service.store().stats(),
        messages: service.metrics().summary(),
    };
    Json(status)
}

/// Get the session of a repo
async fn get_session(
    State(service): State<AppState>,
    Path(repo_id): Path<String>,
) -> impl IntoResponse {
    match service.session_snapshot(&repo_id) {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Unknown repo {repo_id}"),
            }),
        )
            .into_response(),
    }
}

/// Get the checkpoints persisted for a session
async fn get_checkpoints(
    State(service): State<AppState>,
    Path((repo_id, session_id)): Path<(String, String)>,
) -> Json<Vec<CheckpointRecord>> {
    Json(service.store().checkpoints(&repo_id, &session_id))
}
