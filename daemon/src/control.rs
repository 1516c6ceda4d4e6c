//! Bridges the HTTP control surface onto the detector channel.

use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use minus_api::{
    ControlError, ControlSurface, DetectionEntry, FusionCounters, ResourceStatus, StatusResponse,
    TrackName,
};

use crate::detector::{ControlCommand, DetectionRecord, DetectorMessage, DetectorSnapshot, TrackStatus};
use crate::observation::Track;
use crate::watchdog::{RecoverySnapshot, WatchdogRegistry};

pub struct DaemonControl {
    sender: Sender<DetectorMessage>,
    published: Arc<RwLock<DetectorSnapshot>>,
    registry: WatchdogRegistry,
}

impl DaemonControl {
    pub fn new(
        sender: Sender<DetectorMessage>,
        published: Arc<RwLock<DetectorSnapshot>>,
        registry: WatchdogRegistry,
    ) -> Self {
        Self {
            sender,
            published,
            registry,
        }
    }

    fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.sender
            .send(DetectorMessage::Command(command))
            .map_err(|_| ControlError::Unavailable("detector thread has stopped".into()))
    }

    fn snapshot(&self) -> DetectorSnapshot {
        match self.published.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ControlSurface for DaemonControl {
    fn status(&self) -> Result<StatusResponse, ControlError> {
        let snapshot = self.snapshot();
        let resources = self.registry.snapshots();
        Ok(status_response(&snapshot, &resources))
    }

    fn detections(&self) -> Result<Vec<DetectionEntry>, ControlError> {
        Ok(self.snapshot().detections.iter().map(detection_entry).collect())
    }

    fn pause(&self, duration: Duration) -> Result<(), ControlError> {
        self.send(ControlCommand::Pause(duration))
    }

    fn resume(&self) -> Result<(), ControlError> {
        self.send(ControlCommand::Resume)
    }

    fn force_block(&self, duration: Duration, label: String) -> Result<(), ControlError> {
        self.send(ControlCommand::ForceBlock { duration, label })
    }

    fn force_stop(&self) -> Result<(), ControlError> {
        self.send(ControlCommand::ForceStop)
    }

    fn set_track_enabled(&self, track: TrackName, enabled: bool) -> Result<(), ControlError> {
        self.send(ControlCommand::SetTrackEnabled {
            track: track_from_name(track),
            enabled,
        })
    }
}

fn track_name(track: Track) -> TrackName {
    match track {
        Track::Primary => TrackName::Primary,
        Track::Secondary => TrackName::Secondary,
    }
}

fn track_from_name(name: TrackName) -> Track {
    match name {
        TrackName::Primary => Track::Primary,
        TrackName::Secondary => Track::Secondary,
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn status_response(snapshot: &DetectorSnapshot, resources: &[RecoverySnapshot]) -> StatusResponse {
    let fusion = &snapshot.fusion;
    StatusResponse {
        blocking: snapshot.blocking,
        source: snapshot.source.label().to_string(),
        label: snapshot.label.clone(),
        blocking_secs: snapshot.blocking_for.map(|d| d.as_secs_f64()),
        paused: snapshot.pause_remaining.is_some(),
        pause_remaining_secs: snapshot.pause_remaining.map(|d| d.as_secs_f64()),
        test_remaining_secs: snapshot.test_remaining.map(|d| d.as_secs_f64()),
        uptime_secs: snapshot.uptime.as_secs(),
        tracks: snapshot.tracks.iter().map(track_status).collect(),
        fusion: FusionCounters {
            primary_consecutive_ad: fusion.primary_consecutive_ad,
            primary_consecutive_clear: fusion.primary_consecutive_clear,
            secondary_consecutive_clear: fusion.secondary_consecutive_clear,
            secondary_window: fusion.secondary_agreement.total,
            secondary_ad_ratio: fusion.secondary_agreement.ad_ratio,
            transition_hold: fusion.transition_hold,
            static_suppressed: fusion.static_suppressed,
        },
        resources: resources.iter().map(resource_status).collect(),
        updated_at: Utc::now(),
    }
}

fn track_status(status: &TrackStatus) -> minus_api::TrackStatus {
    minus_api::TrackStatus {
        track: track_name(status.track),
        enabled: status.enabled,
        degraded: status.degraded,
        frames: status.frames,
        failures: status.failures,
        last_latency_ms: status.last_latency.map(millis),
    }
}

fn resource_status(snapshot: &RecoverySnapshot) -> ResourceStatus {
    ResourceStatus {
        id: snapshot.resource_id.clone(),
        state: snapshot.state.to_string(),
        consecutive_failures: snapshot.consecutive_failures,
        restarts: snapshot.restarts,
        current_backoff_secs: snapshot.current_backoff.as_secs_f64(),
        last_healthy_secs_ago: snapshot.last_healthy_age.map(|d| d.as_secs_f64()),
        grace_remaining_secs: snapshot.grace_remaining.map(|d| d.as_secs_f64()),
    }
}

fn detection_entry(record: &DetectionRecord) -> DetectionEntry {
    DetectionEntry {
        at: record.at,
        track: track_name(record.track),
        confidence: record.confidence,
        latency_ms: millis(record.latency),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::testing::RecordingSink;
    use crate::config::{FusionConfig, ResourceConfig};
    use crate::detector::Detector;
    use crate::observation::{ClassifierObservation, Verdict};
    use crate::watchdog::RecoveryState;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn commands_are_forwarded_to_detector() {
        let t0 = Instant::now();
        let detector = Detector::new(FusionConfig::default(), Box::new(RecordingSink::default()), t0);
        let (sender, receiver) = mpsc::channel();
        let control = DaemonControl::new(sender, detector.published(), WatchdogRegistry::default());

        control.pause(Duration::from_secs(60)).unwrap();
        control.set_track_enabled(TrackName::Secondary, false).unwrap();
        control
            .force_block(Duration::from_secs(10), "manual".into())
            .unwrap();

        let received: Vec<DetectorMessage> = receiver.try_iter().collect();
        assert!(matches!(
            received.as_slice(),
            [
                DetectorMessage::Command(ControlCommand::Pause(_)),
                DetectorMessage::Command(ControlCommand::SetTrackEnabled {
                    track: Track::Secondary,
                    enabled: false
                }),
                DetectorMessage::Command(ControlCommand::ForceBlock { .. }),
            ]
        ));
    }

    #[test]
    fn closed_channel_is_unavailable() {
        let t0 = Instant::now();
        let detector = Detector::new(FusionConfig::default(), Box::new(RecordingSink::default()), t0);
        let (sender, receiver) = mpsc::channel();
        drop(receiver);
        let control = DaemonControl::new(sender, detector.published(), WatchdogRegistry::default());
        assert!(matches!(
            control.force_stop(),
            Err(ControlError::Unavailable(_))
        ));
    }

    #[test]
    fn status_reflects_published_snapshot() {
        let t0 = Instant::now();
        let mut detector =
            Detector::new(FusionConfig::default(), Box::new(RecordingSink::default()), t0);
        detector.handle(
            DetectorMessage::Observation(ClassifierObservation::new(
                Track::Primary,
                Verdict::ad(),
                t0,
                Duration::from_millis(90),
            )),
            t0,
        );

        let registry = WatchdogRegistry::default();
        let state = RecoveryState::new(&ResourceConfig::new("primary-classifier"), t0);
        registry.publish(state.snapshot(t0));

        let (sender, _receiver) = mpsc::channel();
        let control = DaemonControl::new(sender, detector.published(), registry);
        let status = control.status().unwrap();
        assert!(status.blocking);
        assert_eq!(status.source, "primary");
        assert_eq!(status.label.as_deref(), Some("PRIMARY"));
        assert_eq!(status.tracks[0].frames, 1);
        assert_eq!(status.tracks[0].last_latency_ms, Some(90));
        assert_eq!(status.resources[0].id, "primary-classifier");
        assert_eq!(status.resources[0].state, "starting");

        let detections = control.detections().unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].track, TrackName::Primary);
    }
}
