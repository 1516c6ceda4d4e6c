//! Manual controls (/api/pause, /api/resume, /api/block/*, /api/tracks/*)

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    routing::post,
};
use std::sync::Arc;
use std::time::Duration;

use crate::AppState;
use crate::constants::{
    DEFAULT_BLOCK_LABEL, DEFAULT_BLOCK_SECS, MAX_BLOCK_SECS, MAX_PAUSE_MINUTES, MIN_BLOCK_SECS,
};
use crate::dto::{ActionResponse, ForceBlockRequest, TrackName};
use crate::error::ControlError;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/pause/{minutes}", post(pause))
        .route("/api/resume", post(resume))
        .route("/api/block/start", post(block_start))
        .route("/api/block/stop", post(block_stop))
        .route("/api/tracks/{track}/enable", post(enable_track))
        .route("/api/tracks/{track}/disable", post(disable_track))
}

/// POST /api/pause/{minutes} - Pause automatic blocking for 1-120 minutes
async fn pause(
    State(state): State<Arc<AppState>>,
    Path(minutes): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    let minutes: u32 = minutes
        .parse()
        .map_err(|_| ControlError::Invalid(format!("`{}` is not a number of minutes", minutes)))?;
    if !(1..=MAX_PAUSE_MINUTES).contains(&minutes) {
        return Err(ControlError::Invalid(format!(
            "pause must be between 1 and {} minutes",
            MAX_PAUSE_MINUTES
        )));
    }
    state
        .control
        .pause(Duration::from_secs(u64::from(minutes) * 60))?;
    Ok(Json(ActionResponse::ok(format!("paused for {} minutes", minutes))))
}

/// POST /api/resume - End a pause early
async fn resume(State(state): State<Arc<AppState>>) -> Result<Json<ActionResponse>, ControlError> {
    state.control.resume()?;
    Ok(Json(ActionResponse::ok("resumed")))
}

/// POST /api/block/start - Manual block; body `{duration_secs?, source?}` is optional
async fn block_start(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ActionResponse>, ControlError> {
    let request: ForceBlockRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ForceBlockRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ControlError::Invalid(format!("bad block request: {}", e)))?
    };

    let secs = request.duration_secs.unwrap_or(DEFAULT_BLOCK_SECS);
    if !secs.is_finite() {
        return Err(ControlError::Invalid("duration_secs must be a number".into()));
    }
    let secs = secs.clamp(MIN_BLOCK_SECS, MAX_BLOCK_SECS);
    let label = request
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_BLOCK_LABEL.to_string());

    state
        .control
        .force_block(Duration::from_secs_f64(secs), label.clone())?;
    Ok(Json(ActionResponse::ok(format!(
        "blocking '{}' for {:.0}s",
        label, secs
    ))))
}

/// POST /api/block/stop - Stop any block now, ignoring the minimum dwell
async fn block_stop(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ActionResponse>, ControlError> {
    state.control.force_stop()?;
    Ok(Json(ActionResponse::ok("stopped")))
}

/// POST /api/tracks/{track}/enable
async fn enable_track(
    State(state): State<Arc<AppState>>,
    Path(track): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    set_track(&state, &track, true)
}

/// POST /api/tracks/{track}/disable
async fn disable_track(
    State(state): State<Arc<AppState>>,
    Path(track): Path<String>,
) -> Result<Json<ActionResponse>, ControlError> {
    set_track(&state, &track, false)
}

fn set_track(
    state: &AppState,
    track: &str,
    enabled: bool,
) -> Result<Json<ActionResponse>, ControlError> {
    let track: TrackName = track.parse().map_err(ControlError::Invalid)?;
    state.control.set_track_enabled(track, enabled)?;
    let verb = if enabled { "enabled" } else { "disabled" };
    Ok(Json(ActionResponse::ok(format!("{} track {}", track, verb))))
}
