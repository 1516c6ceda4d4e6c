//! Health watchdog: one probe loop per managed resource.
//!
//! Each loop owns its [`RecoveryState`] and is the only writer of its entry
//! in the [`WatchdogRegistry`]. Restarts back off exponentially and the
//! backoff resets once the resource has stayed healthy long enough.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ResourceConfig;
use crate::detector::DetectorMessage;
use crate::resource::{Health, ManagedResource};
use crate::source::SignalState;
use crate::tasks::RepeatingTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Paused while the video signal is missing.
    Paused,
    /// Inside a startup or restart grace period.
    Suppressed,
    Healthy,
    /// Failing, but not for longer than the stall threshold yet.
    Unhealthy { failures: u32 },
    /// Stalled, but the previous restart's backoff has not elapsed.
    Waiting { failures: u32, retry_in: Duration },
    Restart { attempt: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Starting,
    Healthy,
    Unhealthy,
    Paused,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResourceState::Starting => "starting",
            ResourceState::Healthy => "healthy",
            ResourceState::Unhealthy => "unhealthy",
            ResourceState::Paused => "paused",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoverySnapshot {
    pub resource_id: String,
    pub state: ResourceState,
    pub consecutive_failures: u32,
    pub restarts: u64,
    pub current_backoff: Duration,
    pub last_healthy_age: Option<Duration>,
    pub grace_remaining: Option<Duration>,
}

/// The watchdog's memory for one resource.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    resource_id: String,
    consecutive_failures: u32,
    last_healthy_time: Option<Instant>,
    backoff: Backoff,
    next_retry_time: Option<Instant>,
    grace_period_until: Option<Instant>,
    unhealthy_since: Option<Instant>,
    healthy_since: Option<Instant>,
    restarts: u64,
    paused: bool,
    stall_threshold: Duration,
    restart_grace: Duration,
    reset_after: Duration,
}

impl RecoveryState {
    /// Starts inside the startup grace period.
    pub fn new(config: &ResourceConfig, now: Instant) -> Self {
        Self {
            resource_id: config.id.clone(),
            consecutive_failures: 0,
            last_healthy_time: None,
            backoff: Backoff::new(config.base_backoff(), config.max_backoff()),
            next_retry_time: None,
            grace_period_until: Some(now + config.startup_grace()),
            unhealthy_since: None,
            healthy_since: None,
            restarts: 0,
            paused: false,
            stall_threshold: config.stall_threshold(),
            restart_grace: config.restart_grace(),
            reset_after: config.reset_after(),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.grace_period_until.is_some_and(|until| now < until)
    }

    /// Folds one probe result into the state and decides what to do.
    pub fn on_probe(&mut self, healthy: bool, now: Instant) -> ProbeDecision {
        if self.in_grace(now) {
            return ProbeDecision::Suppressed;
        }

        if healthy {
            if self.unhealthy_since.take().is_some() {
                info!("[Watchdog] {} recovered", self.resource_id);
            }
            self.last_healthy_time = Some(now);
            let since = *self.healthy_since.get_or_insert(now);
            let dirty = self.consecutive_failures > 0 || self.backoff.attempts() > 0;
            if dirty && now.saturating_duration_since(since) >= self.reset_after {
                info!(
                    "[Watchdog] {} healthy for {:.0}s, backoff reset",
                    self.resource_id,
                    now.saturating_duration_since(since).as_secs_f64()
                );
                self.consecutive_failures = 0;
                self.backoff.reset();
                self.next_retry_time = None;
            }
            return ProbeDecision::Healthy;
        }

        self.healthy_since = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let failures = self.consecutive_failures;
        let since = *self.unhealthy_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.stall_threshold {
            return ProbeDecision::Unhealthy { failures };
        }
        if let Some(retry_at) = self.next_retry_time.filter(|retry_at| now < *retry_at) {
            return ProbeDecision::Waiting {
                failures,
                retry_in: retry_at.saturating_duration_since(now),
            };
        }
        ProbeDecision::Restart {
            attempt: self.restarts + 1,
        }
    }

    /// Records an issued restart and returns the backoff before the next one.
    pub fn record_restart(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.next_delay();
        self.restarts += 1;
        self.next_retry_time = Some(now + delay);
        self.grace_period_until = Some(now + self.restart_grace);
        self.healthy_since = None;
        delay
    }

    /// Returns true on the transition into the paused state.
    pub fn pause(&mut self) -> bool {
        !std::mem::replace(&mut self.paused, true)
    }

    /// Fresh start after the signal returns: no failures, base backoff, short grace.
    pub fn resume(&mut self, now: Instant) {
        self.paused = false;
        self.consecutive_failures = 0;
        self.backoff.reset();
        self.next_retry_time = None;
        self.unhealthy_since = None;
        self.healthy_since = None;
        self.grace_period_until = Some(now + self.restart_grace);
    }

    pub fn snapshot(&self, now: Instant) -> RecoverySnapshot {
        let state = if self.paused {
            ResourceState::Paused
        } else if self.in_grace(now) {
            ResourceState::Starting
        } else if self.unhealthy_since.is_some() {
            ResourceState::Unhealthy
        } else if self.last_healthy_time.is_some() {
            ResourceState::Healthy
        } else {
            ResourceState::Starting
        };
        RecoverySnapshot {
            resource_id: self.resource_id.clone(),
            state,
            consecutive_failures: self.consecutive_failures,
            restarts: self.restarts,
            current_backoff: self.backoff.current(),
            last_healthy_age: self
                .last_healthy_time
                .map(|at| now.saturating_duration_since(at)),
            grace_remaining: self
                .grace_period_until
                .filter(|until| *until > now)
                .map(|until| until.saturating_duration_since(now)),
        }
    }
}

/// Bumped whenever a sample-invalidating resource restarts.
#[derive(Clone, Default)]
pub struct PipelineEpoch(Arc<AtomicU64>);

impl PipelineEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Latest snapshot of every watched resource, keyed by id.
#[derive(Clone, Default)]
pub struct WatchdogRegistry {
    entries: Arc<RwLock<BTreeMap<String, RecoverySnapshot>>>,
}

impl WatchdogRegistry {
    pub fn publish(&self, snapshot: RecoverySnapshot) {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(snapshot.resource_id.clone(), snapshot);
    }

    pub fn snapshots(&self) -> Vec<RecoverySnapshot> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.values().cloned().collect()
    }

    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .snapshots()
            .iter()
            .map(|snapshot| {
                format!(
                    "{}={} ({} restarts)",
                    snapshot.resource_id, snapshot.state, snapshot.restarts
                )
            })
            .collect();
        if parts.is_empty() {
            "no managed resources".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Probe loop body for one resource.
pub struct ResourceWatchdog {
    resource: Box<dyn ManagedResource>,
    config: ResourceConfig,
    state: RecoveryState,
    signal: Option<SignalState>,
    events: Sender<DetectorMessage>,
    epoch: PipelineEpoch,
    registry: WatchdogRegistry,
}

impl ResourceWatchdog {
    pub fn new(
        resource: Box<dyn ManagedResource>,
        config: ResourceConfig,
        signal: SignalState,
        events: Sender<DetectorMessage>,
        epoch: PipelineEpoch,
        registry: WatchdogRegistry,
        now: Instant,
    ) -> Self {
        let state = RecoveryState::new(&config, now);
        let signal = config.requires_signal.then_some(signal);
        Self {
            resource,
            config,
            state,
            signal,
            events,
            epoch,
            registry,
        }
    }

    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    /// One probe cycle.
    pub fn check(&mut self, now: Instant) -> ProbeDecision {
        let decision = self.probe_cycle(now);
        self.registry.publish(self.state.snapshot(now));
        decision
    }

    fn probe_cycle(&mut self, now: Instant) -> ProbeDecision {
        let id = self.config.id.as_str();
        if let Some(signal) = &self.signal {
            if !signal.present() {
                if self.state.pause() {
                    info!("[Watchdog] {id}: no signal, pausing health checks");
                }
                return ProbeDecision::Paused;
            }
            if self.state.is_paused() {
                info!("[Watchdog] {id}: signal back, resuming health checks");
                self.state.resume(now);
            }
        }

        let health = self.resource.probe(self.config.probe_timeout());
        let decision = self.state.on_probe(health.is_healthy(), now);
        let reason = match &health {
            Health::Healthy => "",
            Health::Unhealthy(reason) => reason.as_str(),
        };
        match decision {
            ProbeDecision::Unhealthy { failures: 1 } => {
                warn!("[Watchdog] {id} unhealthy: {reason}");
            }
            ProbeDecision::Unhealthy { failures } => {
                debug!("[Watchdog] {id} still unhealthy ({failures} failures): {reason}");
            }
            ProbeDecision::Waiting { retry_in, .. } => {
                debug!(
                    "[Watchdog] {id} stalled, next restart in {:.1}s",
                    retry_in.as_secs_f64()
                );
            }
            ProbeDecision::Restart { attempt } => self.restart(attempt, reason, now),
            ProbeDecision::Healthy | ProbeDecision::Suppressed | ProbeDecision::Paused => {}
        }
        decision
    }

    fn restart(&mut self, attempt: u64, reason: &str, now: Instant) {
        let id = self.config.id.clone();
        warn!("[Watchdog] restarting {id} (attempt {attempt}): {reason}");
        if let Err(err) = self.resource.restart() {
            error!("[Watchdog] restart of {id} failed: {err:#}");
        }
        let delay = self.state.record_restart(now);
        info!(
            "[Watchdog] {id}: backoff {:.0}s before next restart",
            delay.as_secs_f64()
        );
        if self.config.invalidates_samples {
            let epoch = self.epoch.bump();
            debug!("[Watchdog] pipeline epoch now {epoch}");
        }
        if self.events.send(DetectorMessage::ResourceRestarted(id)).is_err() {
            debug!("[Watchdog] detector gone, restart not reported");
        }
    }

    /// Starts the resource and runs the probe loop until the task is dropped.
    pub fn spawn(mut self) -> io::Result<RepeatingTask> {
        let id = self.config.id.clone();
        if let Err(err) = self.resource.start() {
            warn!("[Watchdog] initial start of {id} failed: {err:#}");
        }
        let now = Instant::now();
        self.state = RecoveryState::new(&self.config, now);
        self.registry.publish(self.state.snapshot(now));
        info!(
            "[Watchdog] watching {id} every {:.0}s (grace {:.0}s)",
            self.config.probe_interval().as_secs_f64(),
            self.config.startup_grace().as_secs_f64()
        );
        RepeatingTask::start(format!("watchdog-{id}"), self.config.probe_interval(), move || {
            self.check(Instant::now());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::mpsc;

    fn config() -> ResourceConfig {
        ResourceConfig {
            startup_grace_secs: 0.0,
            restart_grace_secs: 0.0,
            stall_threshold_secs: 6.0,
            base_backoff_secs: 1.0,
            max_backoff_secs: 60.0,
            reset_after_secs: 5.0,
            ..ResourceConfig::new("capture")
        }
    }

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn grace_period_suppresses_probes() {
        let t0 = Instant::now();
        let config = ResourceConfig {
            startup_grace_secs: 30.0,
            ..config()
        };
        let mut state = RecoveryState::new(&config, t0);
        assert_eq!(state.on_probe(false, at(t0, 10)), ProbeDecision::Suppressed);
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(
            state.on_probe(false, at(t0, 30)),
            ProbeDecision::Unhealthy { failures: 1 }
        );
    }

    #[test]
    fn restarts_once_stalled_past_threshold() {
        let t0 = Instant::now();
        let mut state = RecoveryState::new(&config(), t0);
        assert!(matches!(
            state.on_probe(false, at(t0, 1)),
            ProbeDecision::Unhealthy { .. }
        ));
        assert!(matches!(
            state.on_probe(false, at(t0, 4)),
            ProbeDecision::Unhealthy { .. }
        ));
        assert_eq!(
            state.on_probe(false, at(t0, 7)),
            ProbeDecision::Restart { attempt: 1 }
        );
    }

    #[test]
    fn waits_out_backoff_between_restarts() {
        let t0 = Instant::now();
        let mut state = RecoveryState::new(&config(), t0);
        state.on_probe(false, t0);
        assert!(matches!(
            state.on_probe(false, at(t0, 6)),
            ProbeDecision::Restart { .. }
        ));
        state.record_restart(at(t0, 6));
        state.record_restart(at(t0, 7));
        // Second restart set a 2s backoff.
        assert!(matches!(
            state.on_probe(false, at(t0, 8)),
            ProbeDecision::Waiting { .. }
        ));
        assert_eq!(
            state.on_probe(false, at(t0, 9)),
            ProbeDecision::Restart { attempt: 3 }
        );
    }

    #[test]
    fn sustained_health_resets_backoff() {
        let t0 = Instant::now();
        let mut state = RecoveryState::new(&config(), t0);
        state.on_probe(false, t0);
        state.on_probe(false, at(t0, 6));
        state.record_restart(at(t0, 6));
        state.record_restart(at(t0, 8));
        assert_eq!(state.current_backoff(), Duration::from_secs(2));

        state.on_probe(true, at(t0, 10));
        state.on_probe(true, at(t0, 13));
        assert_eq!(state.consecutive_failures(), 2);
        assert_eq!(state.current_backoff(), Duration::from_secs(2));

        state.on_probe(true, at(t0, 15));
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.current_backoff(), Duration::from_secs(1));
        assert_eq!(state.restarts(), 2);
    }

    #[test]
    fn a_blip_of_health_does_not_reset_backoff() {
        let t0 = Instant::now();
        let mut state = RecoveryState::new(&config(), t0);
        state.on_probe(false, t0);
        state.on_probe(false, at(t0, 6));
        state.record_restart(at(t0, 6));
        state.on_probe(true, at(t0, 8));
        state.on_probe(false, at(t0, 10));
        assert_eq!(state.current_backoff(), Duration::from_secs(1));
        assert_eq!(state.consecutive_failures(), 3);
    }

    #[test]
    fn signal_resume_starts_fresh() {
        let t0 = Instant::now();
        let mut state = RecoveryState::new(&config(), t0);
        state.on_probe(false, t0);
        state.record_restart(at(t0, 6));
        assert!(state.pause());
        assert!(!state.pause());
        state.resume(at(t0, 20));
        assert!(!state.is_paused());
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.current_backoff(), Duration::from_secs(1));
    }

    /// Resource whose probe results are scripted and whose restarts are counted.
    struct ScriptedResource {
        probes: VecDeque<bool>,
        restarts: Arc<Mutex<u32>>,
    }

    impl ManagedResource for ScriptedResource {
        fn id(&self) -> &str {
            "capture"
        }

        fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn probe(&mut self, _timeout: Duration) -> Health {
            match self.probes.pop_front() {
                Some(true) | None => Health::Healthy,
                Some(false) => Health::Unhealthy("scripted".into()),
            }
        }

        fn restart(&mut self) -> anyhow::Result<()> {
            *self.restarts.lock().unwrap() += 1;
            Ok(())
        }

        fn stop(&mut self) {}
    }

    fn watchdog(
        probes: &[bool],
        config: ResourceConfig,
        signal: SignalState,
    ) -> (
        ResourceWatchdog,
        Arc<Mutex<u32>>,
        mpsc::Receiver<DetectorMessage>,
        PipelineEpoch,
        WatchdogRegistry,
    ) {
        let restarts = Arc::new(Mutex::new(0));
        let resource = ScriptedResource {
            probes: probes.iter().copied().collect(),
            restarts: Arc::clone(&restarts),
        };
        let (tx, rx) = mpsc::channel();
        let epoch = PipelineEpoch::default();
        let registry = WatchdogRegistry::default();
        let watchdog = ResourceWatchdog::new(
            Box::new(resource),
            config,
            signal,
            tx,
            epoch.clone(),
            registry.clone(),
            Instant::now(),
        );
        (watchdog, restarts, rx, epoch, registry)
    }

    #[test]
    fn restart_notifies_detector_and_bumps_epoch() {
        let config = ResourceConfig {
            invalidates_samples: true,
            ..config()
        };
        let (mut watchdog, restarts, rx, epoch, registry) =
            watchdog(&[false, false, false], config, SignalState::new(true));
        let t0 = Instant::now();
        watchdog.check(at(t0, 1));
        watchdog.check(at(t0, 4));
        assert_eq!(
            watchdog.check(at(t0, 7)),
            ProbeDecision::Restart { attempt: 1 }
        );
        assert_eq!(*restarts.lock().unwrap(), 1);
        assert_eq!(epoch.current(), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(DetectorMessage::ResourceRestarted(id)) if id == "capture"
        ));
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].restarts, 1);
    }

    #[test]
    fn missing_signal_pauses_signal_bound_resources() {
        let signal = SignalState::new(false);
        let config = ResourceConfig {
            requires_signal: true,
            ..config()
        };
        let (mut watchdog, restarts, _rx, _epoch, registry) =
            watchdog(&[false; 10], config, signal.clone());
        let t0 = Instant::now();
        for secs in [1, 4, 7, 10] {
            assert_eq!(watchdog.check(at(t0, secs)), ProbeDecision::Paused);
        }
        assert_eq!(*restarts.lock().unwrap(), 0);
        assert_eq!(registry.snapshots()[0].state, ResourceState::Paused);

        signal.set(true);
        assert!(matches!(
            watchdog.check(at(t0, 13)),
            ProbeDecision::Unhealthy { failures: 1 }
        ));
    }
}
