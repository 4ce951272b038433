//! Operator endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::AppState;

/// Liveness document
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rota-modem",
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "instances": state.pool.len(),
        })),
    )
}

/// Snapshot of every proxy instance
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.snapshots())
}
