//! One polling loop per classifier track.
//!
//! Each poll grabs the latest frame, asks the track's classifier with a
//! deadline and reports the result to the detector. Loops never wait on each
//! other: a hung secondary call cannot delay primary polling.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::classifier::Classifier;
use crate::config::SamplerConfig;
use crate::detector::DetectorMessage;
use crate::observation::{ClassifierObservation, Track};
use crate::screenshots::{SaveOutcome, ScreenshotStore};
use crate::source::{FrameSource, SignalState};
use crate::stillness::StillnessTracker;
use crate::tasks::{RepeatingTask, TimedCall};
use crate::transition::TransitionDetector;
use crate::watchdog::PipelineEpoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NoSignal,
    /// Degraded and not yet time for the next probe poll.
    Waiting,
    NoFrame,
    Observed { is_ad: bool },
    Failed,
    /// The pipeline restarted while the call was in flight.
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    Degraded,
    Restored,
}

/// Consecutive-failure tracking and degraded mode for one track.
#[derive(Debug, Clone)]
pub struct TrackHealth {
    max_failures: u32,
    retry_interval: Duration,
    consecutive_failures: u32,
    degraded: bool,
    last_attempt: Option<Instant>,
}

impl TrackHealth {
    pub fn new(max_failures: u32, retry_interval: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            retry_interval,
            consecutive_failures: 0,
            degraded: false,
            last_attempt: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// While degraded only one probe poll per retry interval goes out.
    pub fn should_poll(&self, now: Instant) -> bool {
        !self.degraded
            || self
                .last_attempt
                .is_none_or(|last| now.saturating_duration_since(last) >= self.retry_interval)
    }

    pub fn record_success(&mut self, now: Instant) -> Option<HealthChange> {
        self.last_attempt = Some(now);
        self.consecutive_failures = 0;
        std::mem::replace(&mut self.degraded, false).then_some(HealthChange::Restored)
    }

    pub fn record_failure(&mut self, now: Instant) -> Option<HealthChange> {
        self.last_attempt = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.degraded && self.consecutive_failures >= self.max_failures {
            self.degraded = true;
            return Some(HealthChange::Degraded);
        }
        None
    }
}

pub struct Sampler {
    track: Track,
    config: SamplerConfig,
    classifier: Arc<dyn Classifier>,
    source: Arc<dyn FrameSource>,
    transitions: Arc<dyn TransitionDetector>,
    screenshots: Option<ScreenshotStore>,
    stillness: Option<StillnessTracker>,
    signal: SignalState,
    epoch: PipelineEpoch,
    events: Sender<DetectorMessage>,
    call: TimedCall,
    health: TrackHealth,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track: Track,
        config: SamplerConfig,
        classifier: Arc<dyn Classifier>,
        source: Arc<dyn FrameSource>,
        transitions: Arc<dyn TransitionDetector>,
        screenshots: Option<ScreenshotStore>,
        signal: SignalState,
        epoch: PipelineEpoch,
        events: Sender<DetectorMessage>,
    ) -> Self {
        let health = TrackHealth::new(config.max_consecutive_failures, config.degraded_retry());
        Self {
            call: TimedCall::new(format!("{track}-classify")),
            track,
            config,
            classifier,
            source,
            transitions,
            screenshots,
            stillness: None,
            signal,
            epoch,
            events,
            health,
        }
    }

    /// Tracks whether this track's frames have stopped changing.
    pub fn with_stillness(mut self, tracker: StillnessTracker) -> Self {
        self.stillness = Some(tracker);
        self
    }

    pub fn health(&self) -> &TrackHealth {
        &self.health
    }

    pub fn poll_once(&mut self, now: Instant) -> PollOutcome {
        if !self.signal.present() {
            return PollOutcome::NoSignal;
        }
        if !self.health.should_poll(now) {
            return PollOutcome::Waiting;
        }

        let frame = match self.source.latest_frame() {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                debug!("[Sampler] {}: no frame: {err:#}", self.track);
                return PollOutcome::NoFrame;
            }
        };

        let still = self
            .stillness
            .as_mut()
            .and_then(|tracker| tracker.observe(&frame, now));
        if let Some(suppressed) = still {
            self.send(DetectorMessage::ScreenStatic(suppressed));
        }

        let epoch = self.epoch.current();
        let started = Instant::now();
        let classifier = Arc::clone(&self.classifier);
        let call_frame = Arc::clone(&frame);
        let result = self
            .call
            .call(self.config.timeout(), move || classifier.classify(&call_frame));
        let latency = started.elapsed();

        let verdict = match result {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(err)) => return self.fail(now, latency, &format!("{err:#}")),
            Err(err) => return self.fail(now, latency, &err.to_string()),
        };

        if self.epoch.current() != epoch {
            debug!("[Sampler] {}: pipeline restarted mid-sample, discarding", self.track);
            self.send(DetectorMessage::Observation(ClassifierObservation::failed(
                self.track, now, latency,
            )));
            return PollOutcome::Invalidated;
        }

        if self.health.record_success(now) == Some(HealthChange::Restored) {
            info!("[Sampler] {} classifier responding again, leaving degraded mode", self.track);
            self.send(DetectorMessage::TrackRestored(self.track));
        }

        let transition = !verdict.is_ad && self.transitions.detect(&frame).is_some();
        if verdict.is_ad {
            self.save_screenshot(&frame, now);
        }
        let observation =
            ClassifierObservation::new(self.track, verdict, now, latency).with_transition(transition);
        self.send(DetectorMessage::Observation(observation));
        PollOutcome::Observed {
            is_ad: verdict.is_ad,
        }
    }

    fn fail(&mut self, now: Instant, latency: Duration, reason: &str) -> PollOutcome {
        debug!("[Sampler] {} poll failed: {reason}", self.track);
        self.send(DetectorMessage::Observation(ClassifierObservation::failed(
            self.track, now, latency,
        )));
        if self.health.record_failure(now) == Some(HealthChange::Degraded) {
            warn!(
                "[Sampler] {} classifier failed {} times in a row ({reason}), degraded mode - retrying every {:.0}s",
                self.track,
                self.health.consecutive_failures(),
                self.config.degraded_retry().as_secs_f64()
            );
            self.send(DetectorMessage::TrackDegraded(self.track));
        }
        PollOutcome::Failed
    }

    fn save_screenshot(&mut self, frame: &crate::source::Frame, now: Instant) {
        let Some(store) = self.screenshots.as_mut() else {
            return;
        };
        match store.save(frame, now) {
            Ok(SaveOutcome::Saved(path)) => debug!("[Sampler] saved {}", path.display()),
            Ok(_) => {}
            Err(err) => warn!("[Sampler] failed to save {} screenshot: {err}", self.track),
        }
    }

    fn send(&self, message: DetectorMessage) {
        if self.events.send(message).is_err() {
            debug!("[Sampler] {}: detector gone", self.track);
        }
    }

    pub fn spawn(mut self) -> io::Result<RepeatingTask> {
        let name = format!("sampler-{}", self.track);
        info!(
            "[Sampler] {} polling every {}ms (timeout {}ms)",
            self.track,
            self.config.poll_interval().as_millis(),
            self.config.timeout().as_millis()
        );
        RepeatingTask::start(name, self.config.poll_interval(), move || {
            self.poll_once(Instant::now());
        })
    }
}
