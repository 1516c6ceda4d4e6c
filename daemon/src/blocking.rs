//! Blocking Controller: owns what is actually on screen and on the speakers.
//!
//! Fusion decides whether an ad is showing; the controller turns that into
//! overlay and mute side effects, issued once per transition. Operator
//! overrides (test mode, pause, force stop) live here too.

use std::time::{Duration, Instant};

use log::{info, warn};

use crate::observation::BlockingSource;

/// Display/output collaborator.
pub trait DisplaySink: Send + Sync {
    fn show_blocking(&self, label: &str, context: &str) -> anyhow::Result<()>;
    fn show_program(&self) -> anyhow::Result<()>;
    fn mute(&self) -> anyhow::Result<()>;
    fn unmute(&self) -> anyhow::Result<()>;

    /// Last known mute state, if the sink can tell.
    fn is_muted(&self) -> Option<bool> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerAction {
    Started { label: String },
    Relabeled { label: String },
    Stopped,
}

#[derive(Debug, Clone)]
struct Applied {
    source: BlockingSource,
    label: String,
    since: Instant,
}

pub struct BlockingController {
    sink: Box<dyn DisplaySink>,
    applied: Option<Applied>,
    test_until: Option<Instant>,
    paused_until: Option<Instant>,
}

impl BlockingController {
    pub fn new(sink: Box<dyn DisplaySink>) -> Self {
        Self {
            sink,
            applied: None,
            test_until: None,
            paused_until: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.applied.is_some()
    }

    /// Source of the applied block. Manual blocks report `None`.
    pub fn source(&self) -> BlockingSource {
        self.applied
            .as_ref()
            .map_or(BlockingSource::None, |applied| applied.source)
    }

    pub fn label(&self) -> Option<&str> {
        self.applied.as_ref().map(|applied| applied.label.as_str())
    }

    pub fn blocking_for(&self, now: Instant) -> Option<Duration> {
        self.applied
            .as_ref()
            .map(|applied| now.saturating_duration_since(applied.since))
    }

    pub fn test_remaining(&self, now: Instant) -> Option<Duration> {
        remaining(self.test_until, now)
    }

    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        remaining(self.paused_until, now)
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        self.pause_remaining(now).is_some()
    }

    /// True while test mode or a pause owns the blocking state.
    pub fn override_active(&self, now: Instant) -> bool {
        self.test_remaining(now).is_some() || self.is_paused(now)
    }

    /// Aligns the applied state with what fusion wants.
    ///
    /// `desired` of [`BlockingSource::None`] means "show the program".
    pub fn reconcile(
        &mut self,
        desired: BlockingSource,
        context: &str,
        now: Instant,
    ) -> Option<ControllerAction> {
        self.expire_overrides(now);

        if self.paused_until.is_some() {
            return None;
        }
        if self.test_until.is_some() {
            // Test mode keeps its own label and ignores automatic stops.
            return None;
        }

        match (&self.applied, desired) {
            (None, BlockingSource::None) => None,
            (None, source) => Some(self.start(source, source.label().to_uppercase(), context, now)),
            (Some(_), BlockingSource::None) => Some(self.stop()),
            (Some(applied), source) if applied.source != source => {
                let label = source.label().to_uppercase();
                if let Err(err) = self.sink.show_blocking(&label, context) {
                    warn!("Failed to update blocking overlay: {err:#}");
                }
                if let Some(applied) = self.applied.as_mut() {
                    applied.source = source;
                    applied.label = label.clone();
                }
                Some(ControllerAction::Relabeled { label })
            }
            (Some(_), _) => None,
        }
    }

    /// Starts a manual block that automatic decisions cannot end early.
    pub fn force_start(&mut self, duration: Duration, label: &str, now: Instant) -> ControllerAction {
        if self.paused_until.take().is_some() {
            info!("Pause cleared by manual block");
        }
        self.test_until = Some(now + duration);
        info!(
            "Manual block '{}' for {:.0}s",
            label,
            duration.as_secs_f64()
        );
        if self.applied.is_some() {
            if let Err(err) = self.sink.show_blocking(label, "manual") {
                warn!("Failed to update blocking overlay: {err:#}");
            }
            if let Some(applied) = self.applied.as_mut() {
                applied.source = BlockingSource::None;
                applied.label = label.to_string();
            }
            return ControllerAction::Relabeled {
                label: label.to_string(),
            };
        }
        self.start(BlockingSource::None, label.to_string(), "manual", now)
    }

    /// Ends any block now, ignoring the minimum dwell and test mode.
    pub fn force_stop(&mut self) -> Option<ControllerAction> {
        self.test_until = None;
        self.applied.is_some().then(|| self.stop())
    }

    pub fn pause(&mut self, duration: Duration, now: Instant) -> Option<ControllerAction> {
        self.paused_until = Some(now + duration);
        self.test_until = None;
        info!(
            "Automatic blocking paused for {:.0} minutes",
            duration.as_secs_f64() / 60.0
        );
        self.applied.is_some().then(|| self.stop())
    }

    pub fn resume(&mut self) -> bool {
        let was_paused = self.paused_until.take().is_some();
        if was_paused {
            info!("Automatic blocking resumed");
        }
        was_paused
    }

    /// Re-issues the side effects for the current state without changing it.
    pub fn reassert(&self) {
        match &self.applied {
            Some(applied) => {
                info!("Re-asserting blocking overlay ({})", applied.label);
                if let Err(err) = self.sink.show_blocking(&applied.label, "restored") {
                    warn!("Failed to re-assert overlay: {err:#}");
                }
                if let Err(err) = self.sink.mute() {
                    warn!("Failed to re-assert mute: {err:#}");
                }
            }
            None => {
                info!("Re-asserting program display");
                if let Err(err) = self.sink.show_program() {
                    warn!("Failed to re-assert program display: {err:#}");
                }
                if let Err(err) = self.sink.unmute() {
                    warn!("Failed to re-assert unmute: {err:#}");
                }
            }
        }
    }

    /// Unmutes if the sink reports muted audio while nothing is blocked.
    pub fn check_stuck_mute(&self) -> bool {
        if self.applied.is_some() || self.sink.is_muted() != Some(true) {
            return false;
        }
        warn!("Audio muted while not blocking - unmuting");
        if let Err(err) = self.sink.unmute() {
            warn!("Failed to unmute: {err:#}");
        }
        true
    }

    fn expire_overrides(&mut self, now: Instant) {
        if self.paused_until.is_some_and(|until| now >= until) {
            self.paused_until = None;
            info!("Pause expired, automatic blocking resumed");
        }
        if self.test_until.is_some_and(|until| now >= until) {
            self.test_until = None;
            info!("Manual block expired");
        }
    }

    fn start(
        &mut self,
        source: BlockingSource,
        label: String,
        context: &str,
        now: Instant,
    ) -> ControllerAction {
        if let Err(err) = self.sink.show_blocking(&label, context) {
            warn!("Failed to show blocking overlay: {err:#}");
        }
        if let Err(err) = self.sink.mute() {
            warn!("Failed to mute audio: {err:#}");
        }
        self.applied = Some(Applied {
            source,
            label: label.clone(),
            since: now,
        });
        ControllerAction::Started { label }
    }

    fn stop(&mut self) -> ControllerAction {
        if let Err(err) = self.sink.show_program() {
            warn!("Failed to show program: {err:#}");
        }
        if let Err(err) = self.sink.unmute() {
            warn!("Failed to unmute audio: {err:#}");
        }
        self.applied = None;
        ControllerAction::Stopped
    }
}

fn remaining(until: Option<Instant>, now: Instant) -> Option<Duration> {
    until
        .filter(|until| *until > now)
        .map(|until| until.saturating_duration_since(now))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::DisplaySink;

    /// Sink that records every call, shared with the test through `events`.
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<String>>>,
        pub muted: Arc<Mutex<Option<bool>>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl DisplaySink for RecordingSink {
        fn show_blocking(&self, label: &str, _context: &str) -> anyhow::Result<()> {
            self.record(format!("show_blocking:{label}"));
            Ok(())
        }

        fn show_program(&self) -> anyhow::Result<()> {
            self.record("show_program".into());
            Ok(())
        }

        fn mute(&self) -> anyhow::Result<()> {
            *self.muted.lock().unwrap() = Some(true);
            self.record("mute".into());
            Ok(())
        }

        fn unmute(&self) -> anyhow::Result<()> {
            *self.muted.lock().unwrap() = Some(false);
            self.record("unmute".into());
            Ok(())
        }

        fn is_muted(&self) -> Option<bool> {
            *self.muted.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    fn controller() -> (BlockingController, RecordingSink) {
        let sink = RecordingSink::default();
        (BlockingController::new(Box::new(sink.clone())), sink)
    }

    #[test]
    fn side_effects_fire_once_per_transition() {
        let t0 = Instant::now();
        let (mut controller, sink) = controller();
        assert_eq!(
            controller.reconcile(BlockingSource::Primary, "", t0),
            Some(ControllerAction::Started {
                label: "PRIMARY".into()
            })
        );
        assert_eq!(controller.reconcile(BlockingSource::Primary, "", t0), None);
        assert_eq!(sink.take(), vec!["show_blocking:PRIMARY", "mute"]);

        assert_eq!(
            controller.reconcile(BlockingSource::None, "", t0),
            Some(ControllerAction::Stopped)
        );
        assert_eq!(controller.reconcile(BlockingSource::None, "", t0), None);
        assert_eq!(sink.take(), vec!["show_program", "unmute"]);
    }

    #[test]
    fn source_upgrade_only_relabels_overlay() {
        let t0 = Instant::now();
        let (mut controller, sink) = controller();
        controller.reconcile(BlockingSource::Primary, "", t0);
        sink.take();
        assert_eq!(
            controller.reconcile(BlockingSource::Both, "", t0),
            Some(ControllerAction::Relabeled {
                label: "BOTH".into()
            })
        );
        assert_eq!(sink.take(), vec!["show_blocking:BOTH"]);
        assert_eq!(controller.source(), BlockingSource::Both);
    }

    #[test]
    fn test_mode_suppresses_automatic_stop_until_expiry() {
        let t0 = Instant::now();
        let (mut controller, sink) = controller();
        controller.force_start(Duration::from_secs(10), "manual", t0);
        assert_eq!(sink.take(), vec!["show_blocking:manual", "mute"]);

        let mid = t0 + Duration::from_secs(5);
        assert_eq!(controller.reconcile(BlockingSource::None, "", mid), None);
        assert!(controller.is_blocking());
        assert_eq!(controller.test_remaining(mid), Some(Duration::from_secs(5)));

        let after = t0 + Duration::from_secs(10);
        assert_eq!(
            controller.reconcile(BlockingSource::None, "", after),
            Some(ControllerAction::Stopped)
        );
    }

    #[test]
    fn force_stop_ends_test_mode() {
        let t0 = Instant::now();
        let (mut controller, _sink) = controller();
        controller.force_start(Duration::from_secs(30), "demo", t0);
        assert_eq!(controller.force_stop(), Some(ControllerAction::Stopped));
        assert_eq!(controller.test_remaining(t0), None);
        assert_eq!(controller.force_stop(), None);
    }

    #[test]
    fn pause_stops_and_ignores_fusion_until_resumed() {
        let t0 = Instant::now();
        let (mut controller, sink) = controller();
        controller.reconcile(BlockingSource::Secondary, "", t0);
        sink.take();

        assert_eq!(
            controller.pause(Duration::from_secs(60), t0),
            Some(ControllerAction::Stopped)
        );
        assert_eq!(controller.reconcile(BlockingSource::Secondary, "", t0), None);
        assert!(!controller.is_blocking());

        assert!(controller.resume());
        assert!(matches!(
            controller.reconcile(BlockingSource::Secondary, "", t0),
            Some(ControllerAction::Started { .. })
        ));
    }

    #[test]
    fn pause_expires_on_its_own() {
        let t0 = Instant::now();
        let (mut controller, _sink) = controller();
        controller.pause(Duration::from_secs(60), t0);
        let later = t0 + Duration::from_secs(61);
        assert!(matches!(
            controller.reconcile(BlockingSource::Primary, "", later),
            Some(ControllerAction::Started { .. })
        ));
        assert!(!controller.is_paused(later));
    }

    #[test]
    fn reassert_replays_current_state() {
        let t0 = Instant::now();
        let (mut controller, sink) = controller();
        controller.reassert();
        assert_eq!(sink.take(), vec!["show_program", "unmute"]);
        controller.reconcile(BlockingSource::Primary, "", t0);
        sink.take();
        controller.reassert();
        assert_eq!(sink.take(), vec!["show_blocking:PRIMARY", "mute"]);
        assert!(controller.is_blocking());
    }

    #[test]
    fn stuck_mute_is_released_when_idle() {
        let (controller, sink) = controller();
        *sink.muted.lock().unwrap() = Some(true);
        assert!(controller.check_stuck_mute());
        assert_eq!(sink.take(), vec!["unmute"]);
        assert!(!controller.check_stuck_mute());
    }
}
