//! Errors returned by the control surface

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The detector is not running or stopped answering
    Unavailable(String),
    /// The request was malformed or out of range
    Invalid(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Unavailable(msg) => write!(f, "Detector unavailable: {}", msg),
            ControlError::Invalid(msg) => write!(f, "Invalid request: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Invalid(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        log::warn!("Control request failed ({}): {}", status, self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
