//! The detector thread: single owner of fusion and blocking state.
//!
//! Samplers, watchdog loops and the control surface never touch that state
//! directly. They send [`DetectorMessage`]s; readers get a consistent copy
//! through [`DetectorHandle::snapshot`].

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::blocking::{BlockingController, ControllerAction, DisplaySink};
use crate::config::FusionConfig;
use crate::fusion::{FusionEngine, FusionEvent, FusionSnapshot};
use crate::observation::{BlockingSource, ClassifierObservation, Track};
use crate::tasks::join_task_handle;

pub const DETECTION_HISTORY_LEN: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    ForceBlock { duration: Duration, label: String },
    ForceStop,
    Pause(Duration),
    Resume,
    SetTrackEnabled { track: Track, enabled: bool },
}

#[derive(Debug, Clone)]
pub enum DetectorMessage {
    Observation(ClassifierObservation),
    TrackDegraded(Track),
    TrackRestored(Track),
    ResourceRestarted(String),
    /// The screen stopped (`true`) or resumed (`false`) changing.
    ScreenStatic(bool),
    Command(ControlCommand),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub at: DateTime<Utc>,
    pub track: Track,
    pub confidence: Option<f32>,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackStatus {
    pub track: Track,
    pub enabled: bool,
    pub degraded: bool,
    pub frames: u64,
    pub failures: u64,
    pub last_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct DetectorSnapshot {
    pub blocking: bool,
    pub source: BlockingSource,
    pub label: Option<String>,
    pub blocking_for: Option<Duration>,
    pub pause_remaining: Option<Duration>,
    pub test_remaining: Option<Duration>,
    pub fusion: FusionSnapshot,
    pub tracks: [TrackStatus; 2],
    pub uptime: Duration,
    /// Newest first.
    pub detections: Vec<DetectionRecord>,
}

impl DetectorSnapshot {
    pub fn track(&self, track: Track) -> &TrackStatus {
        match track {
            Track::Primary => &self.tracks[0],
            Track::Secondary => &self.tracks[1],
        }
    }

    /// One-line summary for the periodic status log.
    pub fn summary(&self) -> String {
        let blocking = match (&self.label, self.blocking_for) {
            (Some(label), Some(elapsed)) => {
                format!("blocking {} for {:.0}s", label, elapsed.as_secs_f64())
            }
            _ => "not blocking".to_string(),
        };
        let tracks = self
            .tracks
            .iter()
            .map(|status| {
                let state = if !status.enabled {
                    "disabled"
                } else if status.degraded {
                    "degraded"
                } else {
                    "ok"
                };
                format!(
                    "{}={} ({} frames, {} failures)",
                    status.track, state, status.frames, status.failures
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let paused = self
            .pause_remaining
            .map(|left| format!(", paused {:.0}s", left.as_secs_f64()))
            .unwrap_or_default();
        format!(
            "{blocking}{paused}; {tracks}; uptime {}m",
            self.uptime.as_secs() / 60
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackCounters {
    frames: u64,
    failures: u64,
    last_latency: Option<Duration>,
}

pub struct Detector {
    fusion: FusionEngine,
    controller: BlockingController,
    started: Instant,
    counters: [TrackCounters; 2],
    detections: VecDeque<DetectionRecord>,
    published: Arc<RwLock<DetectorSnapshot>>,
}

impl Detector {
    pub fn new(config: FusionConfig, sink: Box<dyn DisplaySink>, now: Instant) -> Self {
        let fusion = FusionEngine::new(config);
        let controller = BlockingController::new(sink);
        let mut detector = Self {
            published: Arc::new(RwLock::new(empty_snapshot(&fusion, now))),
            fusion,
            controller,
            started: now,
            counters: [TrackCounters::default(); 2],
            detections: VecDeque::with_capacity(DETECTION_HISTORY_LEN),
        };
        detector.publish(now);
        detector
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    pub fn controller(&self) -> &BlockingController {
        &self.controller
    }

    pub fn published(&self) -> Arc<RwLock<DetectorSnapshot>> {
        Arc::clone(&self.published)
    }

    /// Folds one classifier poll into fusion and applies the outcome.
    pub fn evaluate(
        &mut self,
        observation: &ClassifierObservation,
        now: Instant,
    ) -> Option<ControllerAction> {
        self.count(observation);
        let event = self.fusion.observe(observation, now);
        self.apply(event, now)
    }

    pub fn handle(&mut self, message: DetectorMessage, now: Instant) {
        match message {
            DetectorMessage::Observation(observation) => {
                self.evaluate(&observation, now);
            }
            DetectorMessage::TrackDegraded(track) => {
                let event = self.fusion.set_degraded(track, true, now);
                self.apply(event, now);
            }
            DetectorMessage::TrackRestored(track) => {
                let event = self.fusion.set_degraded(track, false, now);
                self.apply(event, now);
            }
            DetectorMessage::ResourceRestarted(id) => {
                info!("Resource '{id}' restarted, re-asserting display state");
                self.controller.reassert();
            }
            DetectorMessage::ScreenStatic(suppressed) => {
                let event = self.fusion.set_static_suppressed(suppressed, now);
                self.apply(event, now);
            }
            DetectorMessage::Command(command) => self.command(command, now),
            DetectorMessage::Shutdown => {}
        }
        self.publish(now);
    }

    /// Periodic re-evaluation without a new observation.
    pub fn tick(&mut self, now: Instant) {
        let event = self.fusion.reevaluate(now);
        self.apply(event, now);
        self.controller.check_stuck_mute();
        self.publish(now);
    }

    /// Returns the display to the program on the way out.
    pub fn shutdown(&mut self, now: Instant) {
        self.fusion.force_stop(now);
        self.controller.force_stop();
        self.publish(now);
    }

    fn command(&mut self, command: ControlCommand, now: Instant) {
        match command {
            ControlCommand::ForceBlock { duration, label } => {
                self.controller.force_start(duration, &label, now);
            }
            ControlCommand::ForceStop => {
                info!("Manual stop requested");
                self.fusion.force_stop(now);
                self.controller.force_stop();
            }
            ControlCommand::Pause(duration) => {
                self.controller.pause(duration, now);
            }
            ControlCommand::Resume => {
                if self.controller.resume() {
                    let event = self.fusion.reevaluate(now);
                    self.apply(event, now);
                }
            }
            ControlCommand::SetTrackEnabled { track, enabled } => {
                let event = self.fusion.set_operator_enabled(track, enabled, now);
                self.apply(event, now);
            }
        }
    }

    fn apply(&mut self, event: Option<FusionEvent>, now: Instant) -> Option<ControllerAction> {
        let desired = if self.fusion.is_blocking() && !self.fusion.static_suppressed() {
            self.fusion.source()
        } else {
            BlockingSource::None
        };
        let context = match event {
            Some(FusionEvent::Started(BlockingSource::Secondary)) => {
                let agreement = self.fusion.state().secondary_history.agreement();
                format!(
                    "agreement {:.0}% of {}",
                    agreement.ad_ratio * 100.0,
                    agreement.total
                )
            }
            _ => String::new(),
        };
        let action = self.controller.reconcile(desired, &context, now);
        self.check_invariant(now);
        action
    }

    /// Fusion's blocking flag must match the applied state outside overrides.
    fn check_invariant(&mut self, now: Instant) {
        if self.controller.override_active(now) || self.fusion.static_suppressed() {
            return;
        }
        if self.fusion.is_blocking() == self.controller.is_blocking() {
            return;
        }
        error!(
            "[Fusion] invariant violated: fusion blocking={} controller blocking={}, resyncing to controller",
            self.fusion.is_blocking(),
            self.controller.is_blocking()
        );
        if self.controller.is_blocking() {
            self.fusion.adopt_blocking(self.controller.source(), now);
        } else {
            self.fusion.force_stop(now);
        }
    }

    fn count(&mut self, observation: &ClassifierObservation) {
        let counters = &mut self.counters[track_index(observation.source)];
        counters.last_latency = Some(observation.latency);
        if observation.failed {
            counters.failures += 1;
            return;
        }
        counters.frames += 1;
        if observation.is_ad {
            if self.detections.len() == DETECTION_HISTORY_LEN {
                self.detections.pop_front();
            }
            self.detections.push_back(DetectionRecord {
                at: Utc::now(),
                track: observation.source,
                confidence: observation.confidence,
                latency: observation.latency,
            });
        }
    }

    fn publish(&self, now: Instant) {
        let snapshot = self.snapshot(now);
        let mut guard = match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
    }

    pub fn snapshot(&self, now: Instant) -> DetectorSnapshot {
        let track_status = |track: Track| {
            let counters = self.counters[track_index(track)];
            let gate = self.fusion.gate(track);
            TrackStatus {
                track,
                enabled: gate.operator_enabled,
                degraded: gate.degraded,
                frames: counters.frames,
                failures: counters.failures,
                last_latency: counters.last_latency,
            }
        };
        DetectorSnapshot {
            blocking: self.controller.is_blocking(),
            source: self.controller.source(),
            label: self.controller.label().map(str::to_string),
            blocking_for: self.controller.blocking_for(now),
            pause_remaining: self.controller.pause_remaining(now),
            test_remaining: self.controller.test_remaining(now),
            fusion: self.fusion.snapshot(now),
            tracks: [track_status(Track::Primary), track_status(Track::Secondary)],
            uptime: now.saturating_duration_since(self.started),
            detections: self.detections.iter().rev().cloned().collect(),
        }
    }

    /// Owner loop: handles messages as they arrive and re-evaluates on a
    /// fixed cadence in between.
    pub fn run(mut self, receiver: Receiver<DetectorMessage>, stop: Arc<AtomicBool>) {
        let interval = self.fusion.config().reevaluate_interval();
        let mut next_tick = Instant::now() + interval;
        info!(
            "[Fusion] detector running (re-evaluate every {}ms)",
            interval.as_millis()
        );

        while !stop.load(Ordering::SeqCst) {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(wait) {
                Ok(DetectorMessage::Shutdown) => break,
                Ok(message) => self.handle(message, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("[Fusion] all senders gone, stopping detector");
                    break;
                }
            }
            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                next_tick = now + interval;
            }
        }

        self.shutdown(Instant::now());
        info!("[Fusion] detector stopped");
    }
}

fn track_index(track: Track) -> usize {
    match track {
        Track::Primary => 0,
        Track::Secondary => 1,
    }
}

fn empty_snapshot(fusion: &FusionEngine, now: Instant) -> DetectorSnapshot {
    let idle = |track: Track| TrackStatus {
        track,
        enabled: true,
        degraded: false,
        frames: 0,
        failures: 0,
        last_latency: None,
    };
    DetectorSnapshot {
        blocking: false,
        source: BlockingSource::None,
        label: None,
        blocking_for: None,
        pause_remaining: None,
        test_remaining: None,
        fusion: fusion.snapshot(now),
        tracks: [idle(Track::Primary), idle(Track::Secondary)],
        uptime: Duration::ZERO,
        detections: Vec::new(),
    }
}

/// Running detector thread plus the ways to talk to it.
pub struct DetectorHandle {
    sender: Sender<DetectorMessage>,
    published: Arc<RwLock<DetectorSnapshot>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DetectorHandle {
    pub fn spawn(detector: Detector) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let published = detector.published();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("minus-detector".into())
            .spawn(move || detector.run(receiver, thread_stop))?;
        Ok(Self {
            sender,
            published,
            stop,
            thread: Some(thread),
        })
    }

    pub fn sender(&self) -> Sender<DetectorMessage> {
        self.sender.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        match self.published.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.sender.send(DetectorMessage::Shutdown);
        join_task_handle(&mut self.thread, "detector");
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::testing::RecordingSink;
    use crate::observation::Verdict;

    fn detector() -> (Detector, RecordingSink, Instant) {
        let sink = RecordingSink::default();
        let t0 = Instant::now();
        (
            Detector::new(FusionConfig::default(), Box::new(sink.clone()), t0),
            sink,
            t0,
        )
    }

    fn ad(track: Track, at: Instant) -> ClassifierObservation {
        ClassifierObservation::new(track, Verdict::ad(), at, Duration::from_millis(80))
    }

    fn clear(track: Track, at: Instant) -> ClassifierObservation {
        ClassifierObservation::new(track, Verdict::clear(), at, Duration::from_millis(80))
    }

    fn secs(t0: Instant, value: u64) -> Instant {
        t0 + Duration::from_secs(value)
    }

    #[test]
    fn primary_ad_blocks_and_clean_run_restores_program() {
        let (mut detector, sink, t0) = detector();
        assert!(matches!(
            detector.evaluate(&ad(Track::Primary, t0), t0),
            Some(ControllerAction::Started { .. })
        ));
        for second in 1..3 {
            assert_eq!(
                detector.evaluate(&clear(Track::Primary, secs(t0, second)), secs(t0, second)),
                None
            );
        }
        assert_eq!(
            detector.evaluate(&clear(Track::Primary, secs(t0, 3)), secs(t0, 3)),
            Some(ControllerAction::Stopped)
        );
        assert_eq!(
            sink.take(),
            vec!["show_blocking:PRIMARY", "mute", "show_program", "unmute"]
        );
    }

    #[test]
    fn force_stop_bypasses_dwell_and_clears_fusion() {
        let (mut detector, _sink, t0) = detector();
        detector.evaluate(&ad(Track::Primary, t0), t0);
        detector.handle(DetectorMessage::Command(ControlCommand::ForceStop), secs(t0, 1));
        assert!(!detector.controller().is_blocking());
        assert!(!detector.fusion().is_blocking());
    }

    #[test]
    fn pause_holds_program_while_fusion_sees_ads() {
        let (mut detector, _sink, t0) = detector();
        detector.handle(
            DetectorMessage::Command(ControlCommand::Pause(Duration::from_secs(600))),
            t0,
        );
        detector.evaluate(&ad(Track::Primary, secs(t0, 1)), secs(t0, 1));
        assert!(detector.fusion().is_blocking());
        assert!(!detector.controller().is_blocking());

        detector.handle(DetectorMessage::Command(ControlCommand::Resume), secs(t0, 2));
        assert!(detector.controller().is_blocking());
    }

    #[test]
    fn static_screen_hides_overlay_until_motion_returns() {
        let (mut detector, sink, t0) = detector();
        detector.evaluate(&ad(Track::Primary, t0), t0);
        sink.take();

        detector.handle(DetectorMessage::ScreenStatic(true), secs(t0, 1));
        assert!(detector.fusion().is_blocking());
        assert!(!detector.controller().is_blocking());
        assert_eq!(sink.take(), vec!["show_program", "unmute"]);
        assert!(detector.snapshot(secs(t0, 1)).fusion.static_suppressed);

        detector.evaluate(&ad(Track::Primary, secs(t0, 2)), secs(t0, 2));
        assert!(!detector.controller().is_blocking());

        detector.handle(DetectorMessage::ScreenStatic(false), secs(t0, 3));
        assert!(detector.controller().is_blocking());
        assert_eq!(sink.take(), vec!["show_blocking:PRIMARY", "mute"]);
    }

    #[test]
    fn manual_block_ignores_static_screen() {
        let (mut detector, _sink, t0) = detector();
        detector.handle(
            DetectorMessage::Command(ControlCommand::ForceBlock {
                duration: Duration::from_secs(10),
                label: "manual".into(),
            }),
            t0,
        );
        detector.handle(DetectorMessage::ScreenStatic(true), secs(t0, 1));
        assert!(detector.controller().is_blocking());
    }

    #[test]
    fn disabling_primary_releases_its_block() {
        let (mut detector, _sink, t0) = detector();
        detector.evaluate(&ad(Track::Primary, t0), t0);
        detector.handle(
            DetectorMessage::Command(ControlCommand::SetTrackEnabled {
                track: Track::Primary,
                enabled: false,
            }),
            secs(t0, 4),
        );
        assert!(!detector.controller().is_blocking());
        let snapshot = detector.snapshot(secs(t0, 4));
        assert!(!snapshot.track(Track::Primary).enabled);
    }

    #[test]
    fn restart_reasserts_without_changing_state() {
        let (mut detector, sink, t0) = detector();
        detector.evaluate(&ad(Track::Primary, t0), t0);
        sink.take();
        detector.handle(DetectorMessage::ResourceRestarted("capture".into()), secs(t0, 1));
        assert_eq!(sink.take(), vec!["show_blocking:PRIMARY", "mute"]);
        assert!(detector.controller().is_blocking());
    }

    #[test]
    fn snapshot_counts_frames_failures_and_detections() {
        let (mut detector, _sink, t0) = detector();
        detector.evaluate(&ad(Track::Secondary, t0), t0);
        detector.evaluate(
            &ClassifierObservation::failed(Track::Secondary, secs(t0, 1), Duration::from_secs(2)),
            secs(t0, 1),
        );
        detector.evaluate(&clear(Track::Primary, secs(t0, 2)), secs(t0, 2));

        let snapshot = detector.snapshot(secs(t0, 2));
        let secondary = snapshot.track(Track::Secondary);
        assert_eq!((secondary.frames, secondary.failures), (1, 1));
        assert_eq!(snapshot.track(Track::Primary).frames, 1);
        assert_eq!(snapshot.detections.len(), 1);
        assert_eq!(snapshot.detections[0].track, Track::Secondary);
        assert_eq!(snapshot.uptime, Duration::from_secs(2));
    }

    #[test]
    fn detection_history_is_bounded() {
        let (mut detector, _sink, t0) = detector();
        for i in 0..(DETECTION_HISTORY_LEN as u64 + 10) {
            let at = t0 + Duration::from_millis(i * 100);
            detector.evaluate(&ad(Track::Primary, at), at);
        }
        assert_eq!(
            detector.snapshot(t0).detections.len(),
            DETECTION_HISTORY_LEN
        );
    }

    #[test]
    fn handle_runs_on_its_own_thread_and_publishes() {
        let (detector, _sink, _t0) = detector();
        let mut handle = DetectorHandle::spawn(detector).unwrap();
        handle
            .sender()
            .send(DetectorMessage::Command(ControlCommand::ForceBlock {
                duration: Duration::from_secs(5),
                label: "manual".into(),
            }))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.snapshot().blocking && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let snapshot = handle.snapshot();
        assert!(snapshot.blocking);
        assert_eq!(snapshot.label.as_deref(), Some("manual"));
        handle.shutdown();
        assert!(!handle.is_running());
        assert!(!handle.snapshot().blocking);
    }
}
