use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, info, warn};

use minus::blocking::DisplaySink;
use minus::classifier::{Classifier, HttpClassifier};
use minus::config::MinusConfig;
use minus::control::DaemonControl;
use minus::detector::{ControlCommand, Detector, DetectorHandle, DetectorMessage, DetectorSnapshot};
use minus::logging;
use minus::observation::Track;
use minus::resource::ProcessResource;
use minus::sampler::Sampler;
use minus::screenshots::ScreenshotStore;
use minus::sink::HookSink;
use minus::source::{FrameSource, HttpSnapshotSource, SignalState, monitor_signal};
use minus::stillness::{MeanDifference, SceneChange, StillnessTracker};
use minus::tasks::{RepeatingTask, sleep_with_cancellation};
use minus::transition::{TransitionDetector, UniformityDetector};
use minus::watchdog::{PipelineEpoch, ResourceWatchdog, WatchdogRegistry};

const STATUS_LOG_INTERVAL_SECS: u64 = 5 * 60;
const SIGNAL_CHECK_INTERVAL_SECS: u64 = 1;
const MAIN_LOOP_CHECK_SECS: u64 = 1;

fn main() {
    logging::init();

    let config_path = match parse_args(env::args().skip(1)) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("usage: minus [--config <path>]");
            process::exit(2);
        }
    };

    let config = match MinusConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load config: {err}");
            process::exit(1);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&stop)) {
            warn!("Failed to register handler for signal {signal}: {err}");
        }
    }

    info!("Starting Minus");
    let mut daemon = match MinusDaemon::start(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("Failed to start: {err:#}");
            process::exit(1);
        }
    };
    info!("Minus started");

    loop {
        if sleep_with_cancellation(&stop, Duration::from_secs(MAIN_LOOP_CHECK_SECS)) {
            info!("Shutdown requested");
            break;
        }
        if !daemon.detector_running() {
            error!("Detector thread exited unexpectedly");
            break;
        }
    }

    daemon.shutdown();
    info!("Minus stopped");
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Option<PathBuf>, String> {
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            other => return Err(format!("unknown argument `{other}`")),
        }
    }
    Ok(config)
}

/// Every running piece of the daemon. Dropped in shutdown order.
struct MinusDaemon {
    api: Option<minus_api::ServerHandle>,
    samplers: Vec<RepeatingTask>,
    watchdogs: Vec<RepeatingTask>,
    signal_task: Option<RepeatingTask>,
    status_task: Option<RepeatingTask>,
    detector: Option<DetectorHandle>,
}

impl MinusDaemon {
    fn start(config: MinusConfig) -> anyhow::Result<Self> {
        let sink: Box<dyn DisplaySink> = Box::new(HookSink::new(config.display.clone()));
        let detector = Detector::new(config.fusion.clone(), sink, Instant::now());
        let published = detector.published();
        let detector = DetectorHandle::spawn(detector).context("failed to spawn detector")?;
        let events = detector.sender();

        let source: Arc<dyn FrameSource> = Arc::new(
            HttpSnapshotSource::new(&config.source).context("failed to build frame source")?,
        );
        let signal = SignalState::new(source.signal_present());
        if !signal.present() {
            warn!("[Sampler] no input signal at startup");
        }
        let signal_task = monitor_signal(
            Arc::clone(&source),
            signal.clone(),
            Duration::from_secs(SIGNAL_CHECK_INTERVAL_SECS),
        )?;

        let epoch = PipelineEpoch::default();
        let registry = WatchdogRegistry::default();

        let mut watchdogs = Vec::with_capacity(config.resources.len());
        for resource_config in &config.resources {
            let watchdog = ResourceWatchdog::new(
                Box::new(ProcessResource::new(resource_config)),
                resource_config.clone(),
                signal.clone(),
                events.clone(),
                epoch.clone(),
                registry.clone(),
                Instant::now(),
            );
            watchdogs.push(watchdog.spawn()?);
        }

        let transitions: Arc<dyn TransitionDetector> = Arc::new(UniformityDetector);
        let scene: Arc<dyn SceneChange> = Arc::new(MeanDifference);
        let mut samplers = Vec::with_capacity(Track::ALL.len());
        for track in Track::ALL {
            let sampler_config = config.sampler(track).clone();
            if !sampler_config.enabled {
                info!("[Sampler] {track} track disabled in config");
                let disable = ControlCommand::SetTrackEnabled {
                    track,
                    enabled: false,
                };
                let _ = events.send(DetectorMessage::Command(disable));
                continue;
            }
            let classifier: Arc<dyn Classifier> = Arc::new(
                HttpClassifier::new(sampler_config.endpoint.clone(), sampler_config.timeout())
                    .with_context(|| format!("failed to build {track} classifier"))?,
            );
            let screenshots = config
                .screenshots
                .enabled
                .then(|| ScreenshotStore::new(&config.screenshots, track));
            let sampler = Sampler::new(
                track,
                sampler_config,
                classifier,
                Arc::clone(&source),
                Arc::clone(&transitions),
                screenshots,
                signal.clone(),
                epoch.clone(),
                events.clone(),
            );
            let sampler = if track == Track::Primary && config.stillness.enabled {
                sampler.with_stillness(StillnessTracker::new(
                    config.stillness.clone(),
                    Arc::clone(&scene),
                ))
            } else {
                sampler
            };
            samplers.push(sampler.spawn()?);
        }

        let api = if config.control.enabled {
            let control = Arc::new(DaemonControl::new(
                events.clone(),
                Arc::clone(&published),
                registry.clone(),
            ));
            Some(minus_api::spawn(config.control.bind_addr()?, control)?)
        } else {
            None
        };

        let status_task = start_status_log(published, registry)?;

        Ok(Self {
            api,
            samplers,
            watchdogs,
            signal_task: Some(signal_task),
            status_task: Some(status_task),
            detector: Some(detector),
        })
    }

    fn detector_running(&self) -> bool {
        self.detector
            .as_ref()
            .is_some_and(DetectorHandle::is_running)
    }

    fn shutdown(&mut self) {
        if let Some(mut api) = self.api.take() {
            api.shutdown();
        }
        // Samplers first so nothing new reaches the detector.
        self.samplers.clear();
        self.watchdogs.clear();
        drop(self.signal_task.take());
        drop(self.status_task.take());
        if let Some(mut detector) = self.detector.take() {
            detector.shutdown();
        }
    }
}

fn start_status_log(
    published: Arc<RwLock<DetectorSnapshot>>,
    registry: WatchdogRegistry,
) -> std::io::Result<RepeatingTask> {
    RepeatingTask::start(
        "minus-status",
        Duration::from_secs(STATUS_LOG_INTERVAL_SECS),
        move || {
            let snapshot = match published.read() {
                Ok(guard) => guard.summary(),
                Err(poisoned) => poisoned.into_inner().summary(),
            };
            info!("Status: {snapshot}; resources: {}", registry.summary());
        },
    )
}
