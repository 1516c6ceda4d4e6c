//! What the HTTP layer needs from the running daemon

use std::time::Duration;

use crate::dto::{DetectionEntry, StatusResponse, TrackName};
use crate::error::ControlError;

/// Read snapshots and manual controls, implemented by the daemon.
///
/// Implementations must not block for long: handlers call these from the
/// async runtime.
pub trait ControlSurface: Send + Sync {
    fn status(&self) -> Result<StatusResponse, ControlError>;

    /// Recent detections, newest first
    fn detections(&self) -> Result<Vec<DetectionEntry>, ControlError>;

    fn pause(&self, duration: Duration) -> Result<(), ControlError>;

    fn resume(&self) -> Result<(), ControlError>;

    fn force_block(&self, duration: Duration, label: String) -> Result<(), ControlError>;

    fn force_stop(&self) -> Result<(), ControlError>;

    fn set_track_enabled(&self, track: TrackName, enabled: bool) -> Result<(), ControlError>;
}
