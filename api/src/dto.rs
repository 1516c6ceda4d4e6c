//! Request and response bodies for the control API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A classifier track as named in URLs and JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackName {
    Primary,
    Secondary,
}

impl FromStr for TrackName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(TrackName::Primary),
            "secondary" => Ok(TrackName::Secondary),
            other => Err(format!("unknown track `{}`", other)),
        }
    }
}

impl fmt::Display for TrackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackName::Primary => f.write_str("primary"),
            TrackName::Secondary => f.write_str("secondary"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub ok: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }
}

/// Full status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub blocking: bool,
    /// none | primary | secondary | both
    pub source: String,
    /// Overlay label while blocking
    pub label: Option<String>,
    pub blocking_secs: Option<f64>,
    pub paused: bool,
    pub pause_remaining_secs: Option<f64>,
    /// Remaining time of a manual block
    pub test_remaining_secs: Option<f64>,
    pub uptime_secs: u64,
    pub tracks: Vec<TrackStatus>,
    pub fusion: FusionCounters,
    pub resources: Vec<ResourceStatus>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatus {
    pub track: TrackName,
    pub enabled: bool,
    pub degraded: bool,
    pub frames: u64,
    pub failures: u64,
    pub last_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionCounters {
    pub primary_consecutive_ad: u32,
    pub primary_consecutive_clear: u32,
    pub secondary_consecutive_clear: u32,
    pub secondary_window: usize,
    pub secondary_ad_ratio: f64,
    pub transition_hold: bool,
    /// Overlay withheld because the screen stopped changing
    pub static_suppressed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub id: String,
    /// starting | healthy | unhealthy | paused
    pub state: String,
    pub consecutive_failures: u32,
    pub restarts: u64,
    pub current_backoff_secs: f64,
    pub last_healthy_secs_ago: Option<f64>,
    pub grace_remaining_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEntry {
    pub at: DateTime<Utc>,
    pub track: TrackName,
    pub confidence: Option<f32>,
    pub latency_ms: u64,
}

/// POST /api/block/start body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForceBlockRequest {
    pub duration_secs: Option<f64>,
    pub source: Option<String>,
}
