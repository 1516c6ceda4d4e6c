//! Fusion of the primary and secondary classifier tracks into one "is-ad"
//! decision.
//!
//! Primary is authoritative: a single "ad" starts blocking and only a run of
//! clean primary observations ends a block it took part in. Secondary is
//! trusted alone only after sustained agreement inside a sliding window, and
//! stops fast on a short run of "clear" answers. Every transition is a pure
//! function of the stored state, the incoming observation and `now`.

mod window;

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::FusionConfig;
use crate::observation::{BlockingSource, ClassifierObservation, Track};

pub use window::{Agreement, SecondaryDecision, SecondaryWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    PrimaryClear,
    SecondaryClear,
    /// A secondary-only block hit its maximum duration.
    SecondaryTimeout,
    /// Every track that triggered the block is disabled or degraded.
    TrackUnavailable,
    Forced,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::PrimaryClear => "primary clear",
            StopReason::SecondaryClear => "secondary clear",
            StopReason::SecondaryTimeout => "secondary-only timeout",
            StopReason::TrackUnavailable => "track unavailable",
            StopReason::Forced => "forced",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionEvent {
    Started(BlockingSource),
    /// The active block gained a co-triggering track.
    Upgraded(BlockingSource),
    Stopped {
        source: BlockingSource,
        after: Duration,
        reason: StopReason,
    },
}

/// Whether a track's observations are currently considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackGate {
    pub operator_enabled: bool,
    pub degraded: bool,
}

impl Default for TrackGate {
    fn default() -> Self {
        Self {
            operator_enabled: true,
            degraded: false,
        }
    }
}

impl TrackGate {
    pub fn is_open(&self) -> bool {
        self.operator_enabled && !self.degraded
    }
}

/// The fusion engine's memory. Mutated only by [`FusionEngine`].
#[derive(Debug, Clone)]
pub struct DetectionState {
    pub primary_consecutive_ad: u32,
    pub primary_consecutive_clear: u32,
    pub secondary_consecutive_ad: u32,
    pub secondary_consecutive_clear: u32,
    pub secondary_history: SecondaryWindow,
    pub last_primary_ad_time: Option<Instant>,
    pub blocking_since: Option<Instant>,
    pub current_source: BlockingSource,
    pub last_secondary_state_change: Option<Instant>,
    /// Primary currently reports an ad (set by one "ad", cleared by the stop run).
    pub primary_active: bool,
    /// Secondary has confirmed an ad (trusted, or by window agreement).
    pub secondary_active: bool,
    /// A transition frame was seen while blocking; clearing waits for real content.
    pub transition_hold: bool,
    pub last_stop: Option<Instant>,
}

impl DetectionState {
    fn new(window: Duration) -> Self {
        Self {
            primary_consecutive_ad: 0,
            primary_consecutive_clear: 0,
            secondary_consecutive_ad: 0,
            secondary_consecutive_clear: 0,
            secondary_history: SecondaryWindow::new(window),
            last_primary_ad_time: None,
            blocking_since: None,
            current_source: BlockingSource::None,
            last_secondary_state_change: None,
            primary_active: false,
            secondary_active: false,
            transition_hold: false,
            last_stop: None,
        }
    }
}

/// Read-only copy of the fusion state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionSnapshot {
    pub blocking: bool,
    pub source: BlockingSource,
    pub blocking_for: Option<Duration>,
    pub primary_active: bool,
    pub secondary_active: bool,
    pub primary_consecutive_ad: u32,
    pub primary_consecutive_clear: u32,
    pub secondary_consecutive_clear: u32,
    pub secondary_agreement: Agreement,
    pub transition_hold: bool,
    pub primary_gate: TrackGate,
    pub secondary_gate: TrackGate,
    pub static_suppressed: bool,
}

pub struct FusionEngine {
    config: FusionConfig,
    state: DetectionState,
    primary_gate: TrackGate,
    secondary_gate: TrackGate,
    /// The screen has stopped changing; no overlay and no secondary-alone starts.
    static_suppressed: bool,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        let state = DetectionState::new(config.secondary_window());
        Self {
            config,
            state,
            primary_gate: TrackGate::default(),
            secondary_gate: TrackGate::default(),
            static_suppressed: false,
        }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    pub fn is_blocking(&self) -> bool {
        self.state.blocking_since.is_some()
    }

    pub fn source(&self) -> BlockingSource {
        self.state.current_source
    }

    pub fn static_suppressed(&self) -> bool {
        self.static_suppressed
    }

    pub fn set_static_suppressed(&mut self, suppressed: bool, now: Instant) -> Option<FusionEvent> {
        if self.static_suppressed != suppressed {
            self.static_suppressed = suppressed;
            if suppressed {
                info!("[Fusion] static screen - suppressing blocking");
            } else {
                info!("[Fusion] screen moving again - blocking re-enabled");
            }
        }
        self.reevaluate(now)
    }

    pub fn gate(&self, track: Track) -> TrackGate {
        match track {
            Track::Primary => self.primary_gate,
            Track::Secondary => self.secondary_gate,
        }
    }

    /// Folds one completed poll into the state and re-evaluates.
    ///
    /// Failed polls, observations from closed tracks and observations whose
    /// frame predates the last stop change nothing.
    pub fn observe(&mut self, obs: &ClassifierObservation, now: Instant) -> Option<FusionEvent> {
        if obs.failed {
            debug!("[Fusion] {} poll failed, ignoring", obs.source);
            return self.reevaluate(now);
        }
        if !self.gate(obs.source).is_open() {
            debug!("[Fusion] {} track closed, ignoring observation", obs.source);
            return self.reevaluate(now);
        }
        if self.state.last_stop.is_some_and(|stop| obs.timestamp < stop) {
            debug!("[Fusion] {} observation predates last stop, discarding", obs.source);
            return self.reevaluate(now);
        }

        match obs.source {
            Track::Primary => self.apply_primary(obs, now),
            Track::Secondary => self.apply_secondary(obs, now),
        }
        self.reevaluate(now)
    }

    /// Periodic re-evaluation without a new observation.
    pub fn reevaluate(&mut self, now: Instant) -> Option<FusionEvent> {
        self.state.secondary_history.prune(now);
        match self.state.blocking_since {
            Some(since) => self.evaluate_blocking(since, now),
            None => self.evaluate_idle(now),
        }
    }

    /// Operator stop; ignores the minimum dwell time.
    pub fn force_stop(&mut self, now: Instant) -> Option<FusionEvent> {
        if !self.is_blocking() {
            return None;
        }
        self.state.primary_active = false;
        self.state.primary_consecutive_ad = 0;
        Some(self.stop(now, StopReason::Forced))
    }

    /// Re-aligns with an externally applied blocking state.
    pub fn adopt_blocking(&mut self, source: BlockingSource, now: Instant) {
        if self.state.blocking_since.is_none() {
            self.state.blocking_since = Some(now);
        }
        self.state.current_source = source;
    }

    pub fn set_operator_enabled(
        &mut self,
        track: Track,
        enabled: bool,
        now: Instant,
    ) -> Option<FusionEvent> {
        self.gate_mut(track).operator_enabled = enabled;
        info!(
            "[Fusion] {} track {} by operator",
            track,
            if enabled { "enabled" } else { "disabled" }
        );
        self.after_gate_change(track, now)
    }

    pub fn set_degraded(&mut self, track: Track, degraded: bool, now: Instant) -> Option<FusionEvent> {
        if self.gate(track).degraded == degraded {
            return None;
        }
        self.gate_mut(track).degraded = degraded;
        if degraded {
            warn!("[Fusion] {} track degraded - relying on the other track", track);
        } else {
            info!("[Fusion] {} track restored", track);
        }
        self.after_gate_change(track, now)
    }

    pub fn snapshot(&self, now: Instant) -> FusionSnapshot {
        FusionSnapshot {
            blocking: self.is_blocking(),
            source: self.state.current_source,
            blocking_for: self
                .state
                .blocking_since
                .map(|since| now.saturating_duration_since(since)),
            primary_active: self.state.primary_active,
            secondary_active: self.state.secondary_active,
            primary_consecutive_ad: self.state.primary_consecutive_ad,
            primary_consecutive_clear: self.state.primary_consecutive_clear,
            secondary_consecutive_clear: self.state.secondary_consecutive_clear,
            secondary_agreement: self.state.secondary_history.agreement(),
            transition_hold: self.state.transition_hold,
            primary_gate: self.primary_gate,
            secondary_gate: self.secondary_gate,
            static_suppressed: self.static_suppressed,
        }
    }

    fn gate_mut(&mut self, track: Track) -> &mut TrackGate {
        match track {
            Track::Primary => &mut self.primary_gate,
            Track::Secondary => &mut self.secondary_gate,
        }
    }

    fn after_gate_change(&mut self, track: Track, now: Instant) -> Option<FusionEvent> {
        if !self.gate(track).is_open() {
            match track {
                Track::Primary => {
                    self.state.primary_active = false;
                    self.state.primary_consecutive_ad = 0;
                    self.state.primary_consecutive_clear = 0;
                }
                Track::Secondary => {
                    self.set_secondary_active(false, now);
                    self.state.secondary_history.clear();
                    self.state.secondary_consecutive_ad = 0;
                    self.state.secondary_consecutive_clear = 0;
                }
            }
        }
        self.reevaluate(now)
    }

    fn apply_primary(&mut self, obs: &ClassifierObservation, now: Instant) {
        let state = &mut self.state;
        if obs.is_ad {
            state.primary_consecutive_ad = state.primary_consecutive_ad.saturating_add(1);
            state.primary_consecutive_clear = 0;
            state.last_primary_ad_time = Some(now);
            state.transition_hold = false;
            if !state.primary_active {
                state.primary_active = true;
                info!("[Fusion] primary detected ad");
            }
            return;
        }

        if obs.transition_frame && state.blocking_since.is_some() {
            if !state.transition_hold {
                info!("[Fusion] primary: transition frame - holding block");
            }
            state.transition_hold = true;
            return;
        }

        state.transition_hold = false;
        state.primary_consecutive_ad = 0;
        state.primary_consecutive_clear = state.primary_consecutive_clear.saturating_add(1);
        if state.primary_active && state.primary_consecutive_clear >= self.config.primary_stop_threshold
        {
            state.primary_active = false;
            info!(
                "[Fusion] primary: ad no longer detected (after {} clean)",
                state.primary_consecutive_clear
            );
        }
    }

    fn apply_secondary(&mut self, obs: &ClassifierObservation, now: Instant) {
        if !obs.is_ad && obs.transition_frame && self.is_blocking() {
            if !self.state.transition_hold {
                info!("[Fusion] secondary: transition frame - holding block");
            }
            self.state.transition_hold = true;
            return;
        }

        self.state.transition_hold = false;
        self.state.secondary_history.prune(now);
        self.state.secondary_history.push(SecondaryDecision {
            at: obs.timestamp,
            is_ad: obs.is_ad,
        });

        if obs.is_ad {
            self.state.secondary_consecutive_ad = self.state.secondary_consecutive_ad.saturating_add(1);
            self.state.secondary_consecutive_clear = 0;
            if self.state.secondary_active {
                return;
            }
            if self.primary_trusted(now) {
                info!("[Fusion] secondary ad confirmed by recent primary signal");
                self.set_secondary_active(true, now);
            } else if self.secondary_may_start_alone(now) {
                let agreement = self.state.secondary_history.agreement();
                info!(
                    "[Fusion] secondary agreement reached ({:.0}% of {} decisions)",
                    agreement.ad_ratio * 100.0,
                    agreement.total
                );
                self.set_secondary_active(true, now);
            }
        } else {
            self.state.secondary_consecutive_ad = 0;
            self.state.secondary_consecutive_clear =
                self.state.secondary_consecutive_clear.saturating_add(1);
            if self.state.secondary_active
                && self.state.secondary_consecutive_clear >= self.config.secondary_stop_threshold
            {
                info!(
                    "[Fusion] secondary: ad no longer detected (after {} clear)",
                    self.state.secondary_consecutive_clear
                );
                self.set_secondary_active(false, now);
            }
        }
    }

    /// A primary "ad" seen within the trust window, and not already overruled by a stop.
    fn primary_trusted(&self, now: Instant) -> bool {
        let Some(last_ad) = self.state.last_primary_ad_time else {
            return false;
        };
        if self.state.last_stop.is_some_and(|stop| last_ad <= stop) {
            return false;
        }
        now.saturating_duration_since(last_ad) <= self.config.primary_trust_window()
    }

    fn secondary_may_start_alone(&self, now: Instant) -> bool {
        let agreement = self.state.secondary_history.agreement();
        if self.static_suppressed {
            if agreement.total >= self.config.secondary_min_decisions {
                debug!(
                    "[Fusion] secondary suppressed on static screen (agreement {:.0}% of {})",
                    agreement.ad_ratio * 100.0,
                    agreement.total
                );
            }
            return false;
        }
        if agreement.total < self.config.secondary_min_decisions {
            return false;
        }
        if let Some(changed) = self.state.last_secondary_state_change {
            if now.saturating_duration_since(changed) < self.config.secondary_min_state() {
                return false;
            }
        }
        agreement.ad_ratio >= self.config.secondary_start_threshold(self.is_blocking())
    }

    fn set_secondary_active(&mut self, active: bool, now: Instant) {
        if self.state.secondary_active != active {
            self.state.secondary_active = active;
            self.state.last_secondary_state_change = Some(now);
        }
    }

    fn evaluate_idle(&mut self, now: Instant) -> Option<FusionEvent> {
        let primary = self.state.primary_active && self.primary_gate.is_open();
        let secondary = self.state.secondary_active && self.secondary_gate.is_open();
        let source = match (primary, secondary) {
            (true, true) => BlockingSource::Both,
            (true, false) => BlockingSource::Primary,
            (false, true) => BlockingSource::Secondary,
            (false, false) => return None,
        };

        self.state.blocking_since = Some(now);
        self.state.current_source = source;
        self.state.transition_hold = false;
        if source == BlockingSource::Secondary {
            let agreement = self.state.secondary_history.agreement();
            warn!(
                "AD BLOCKING STARTED (SECONDARY, agreement {:.0}% of {} decisions)",
                agreement.ad_ratio * 100.0,
                agreement.total
            );
        } else {
            warn!("AD BLOCKING STARTED ({})", source.label().to_uppercase());
        }
        Some(FusionEvent::Started(source))
    }

    fn evaluate_blocking(&mut self, since: Instant, now: Instant) -> Option<FusionEvent> {
        let mut source = self.state.current_source;
        if self.state.primary_active && self.primary_gate.is_open() {
            source = source.with(Track::Primary);
        }
        if self.state.secondary_active && self.secondary_gate.is_open() {
            source = source.with(Track::Secondary);
        }
        let upgraded = source != self.state.current_source;
        if upgraded {
            info!(
                "[Fusion] blocking source upgraded {} -> {}",
                self.state.current_source, source
            );
            self.state.current_source = source;
        }

        let elapsed = now.saturating_duration_since(since);
        let may_stop = elapsed >= self.config.min_blocking() && !self.state.transition_hold;
        if may_stop {
            if let Some(reason) = self.stop_reason(elapsed) {
                return Some(self.stop(now, reason));
            }
        }

        upgraded.then_some(FusionEvent::Upgraded(source))
    }

    fn stop_reason(&self, elapsed: Duration) -> Option<StopReason> {
        let source = self.state.current_source;
        if source.includes(Track::Primary) && self.primary_gate.is_open() {
            return (self.state.primary_consecutive_clear >= self.config.primary_stop_threshold)
                .then_some(StopReason::PrimaryClear);
        }
        if source.includes(Track::Secondary) && self.secondary_gate.is_open() {
            if self.state.secondary_consecutive_clear >= self.config.secondary_stop_threshold {
                return Some(StopReason::SecondaryClear);
            }
            let alone = source == BlockingSource::Secondary;
            if alone
                && self
                    .config
                    .secondary_alone_max()
                    .is_some_and(|limit| elapsed >= limit)
            {
                return Some(StopReason::SecondaryTimeout);
            }
            return None;
        }
        Some(StopReason::TrackUnavailable)
    }

    fn stop(&mut self, now: Instant, reason: StopReason) -> FusionEvent {
        let since = self.state.blocking_since.take().unwrap_or(now);
        let source = std::mem::take(&mut self.state.current_source);
        let after = now.saturating_duration_since(since);

        self.state.secondary_history.clear();
        self.set_secondary_active(false, now);
        self.state.secondary_consecutive_ad = 0;
        self.state.secondary_consecutive_clear = 0;
        self.state.transition_hold = false;
        self.state.last_stop = Some(now);

        warn!(
            "AD BLOCKING ENDED after {:.1}s (source {}, {})",
            after.as_secs_f64(),
            source.label().to_uppercase(),
            reason
        );
        FusionEvent::Stopped {
            source,
            after,
            reason,
        }
    }
}
