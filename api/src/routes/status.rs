//! Read-only endpoints (/api/health, /api/status, /api/detections)

use axum::{Json, Router, extract::State, routing::get};
use std::sync::Arc;

use crate::AppState;
use crate::dto::{DetectionEntry, HealthResponse, StatusResponse};
use crate::error::ControlError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/detections", get(detections))
}

/// GET /api/health - Liveness of the HTTP server itself
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// GET /api/status - Blocking, track and resource snapshot
async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ControlError> {
    state.control.status().map(Json)
}

/// GET /api/detections - Recent detections, newest first
async fn detections(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<DetectionEntry>>, ControlError> {
    state.control.detections().map(Json)
}
