//! Daemon configuration.
//!
//! Every tunable has a named default below. A JSON file may override any
//! subset of fields; a missing file means "all defaults".

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::error::MinusError;
use crate::observation::Track;

pub const CONFIG_PATH_ENV: &str = "MINUS_CONFIG";
const CONFIG_FILE_NAME: &str = "minus.json";

// Fusion: primary (authoritative) track.
pub const DEFAULT_PRIMARY_STOP_THRESHOLD: u32 = 3;
pub const DEFAULT_PRIMARY_TRUST_WINDOW_SECS: f64 = 5.0;

// Fusion: secondary (contextual) track.
pub const DEFAULT_SECONDARY_WINDOW_SECS: f64 = 45.0;
pub const DEFAULT_SECONDARY_MIN_DECISIONS: usize = 4;
pub const DEFAULT_SECONDARY_START_AGREEMENT: f64 = 0.80;
pub const DEFAULT_SECONDARY_HYSTERESIS_BOOST: f64 = 0.10;
pub const DEFAULT_SECONDARY_MIN_STATE_SECS: f64 = 8.0;
pub const DEFAULT_SECONDARY_STOP_THRESHOLD: u32 = 2;
/// Real ads rarely run past 90s; uncorroborated blocks are cut off there.
pub const DEFAULT_SECONDARY_ALONE_MAX_SECS: f64 = 90.0;

// Fusion: global anti-flicker.
pub const DEFAULT_MIN_BLOCKING_SECS: f64 = 3.0;
pub const DEFAULT_REEVALUATE_INTERVAL_MS: u64 = 250;

// Samplers.
pub const DEFAULT_PRIMARY_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_PRIMARY_TIMEOUT_MS: u64 = 1500;
pub const DEFAULT_SECONDARY_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SECONDARY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_DEGRADED_RETRY_SECS: f64 = 30.0;

// Watchdog.
pub const DEFAULT_PROBE_INTERVAL_SECS: f64 = 3.0;
pub const DEFAULT_PROBE_TIMEOUT_SECS: f64 = 2.0;
pub const DEFAULT_STALL_THRESHOLD_SECS: f64 = 6.0;
pub const DEFAULT_STARTUP_GRACE_SECS: f64 = 30.0;
pub const DEFAULT_RESTART_GRACE_SECS: f64 = 2.0;
pub const DEFAULT_BASE_BACKOFF_SECS: f64 = 1.0;
pub const DEFAULT_MAX_BACKOFF_SECS: f64 = 60.0;
pub const DEFAULT_RESET_AFTER_SECS: f64 = 5.0;

// Static-screen suppression.
pub const DEFAULT_SCENE_CHANGE_THRESHOLD: f64 = 0.01;
pub const DEFAULT_STATIC_AFTER_SECS: f64 = 2.5;
pub const DEFAULT_STATIC_AFTER_POLLS: u32 = 4;
pub const DEFAULT_DYNAMIC_COOLDOWN_SECS: f64 = 0.5;

// Persistence and surfaces.
pub const DEFAULT_MAX_SCREENSHOTS: usize = 50;
pub const DEFAULT_SCREENSHOT_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_PHASH_DISTANCE_THRESHOLD: u32 = 10;
pub const DEFAULT_SNAPSHOT_URL: &str = "http://localhost:9090/snapshot";
pub const DEFAULT_CAPTURE_DEVICE: &str = "/dev/video0";
pub const DEFAULT_CONTROL_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_PRIMARY_ENDPOINT: &str = "http://localhost:9100/classify";
pub const DEFAULT_SECONDARY_ENDPOINT: &str = "http://localhost:9200/classify";

/// Upper bound for any duration read from the file.
pub const MAX_CONFIG_SECS: f64 = 24.0 * 60.0 * 60.0;

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_CONFIG_SECS)).unwrap_or(Duration::ZERO)
}

fn check_secs(field: &str, value: f64) -> Result<(), MinusError> {
    if value.is_finite() && (0.0..=MAX_CONFIG_SECS).contains(&value) {
        return Ok(());
    }
    Err(MinusError::Config(format!(
        "{field} must be between 0 and {MAX_CONFIG_SECS} seconds, got {value}"
    )))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MinusConfig {
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default = "SamplerConfig::primary", deserialize_with = "primary_sampler")]
    pub primary: SamplerConfig,
    #[serde(default = "SamplerConfig::secondary", deserialize_with = "secondary_sampler")]
    pub secondary: SamplerConfig,
    #[serde(default = "ResourceConfig::defaults")]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub stillness: StillnessConfig,
    #[serde(default)]
    pub screenshots: ScreenshotConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Clean primary observations in a row needed to stop a primary block.
    pub primary_stop_threshold: u32,
    /// How long after a primary "ad" a single secondary "ad" is trusted.
    pub primary_trust_window_secs: f64,
    /// Age limit for the secondary decision history.
    pub secondary_window_secs: f64,
    /// Decisions required in the window before secondary may act alone.
    pub secondary_min_decisions: usize,
    /// Fraction of "ad" decisions required for secondary to act alone.
    pub secondary_start_agreement: f64,
    /// Extra agreement required when flipping from not-blocking to blocking.
    pub secondary_hysteresis_boost: f64,
    /// Minimum time between secondary-driven state changes.
    pub secondary_min_state_secs: f64,
    /// Clear secondary observations in a row needed to stop a secondary block.
    pub secondary_stop_threshold: u32,
    /// Hard cap on a secondary-only block.
    pub secondary_alone_max_secs: Option<f64>,
    /// No block may end sooner than this after it started.
    pub min_blocking_secs: f64,
    /// Cadence of the periodic re-evaluation loop.
    pub reevaluate_interval_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            primary_stop_threshold: DEFAULT_PRIMARY_STOP_THRESHOLD,
            primary_trust_window_secs: DEFAULT_PRIMARY_TRUST_WINDOW_SECS,
            secondary_window_secs: DEFAULT_SECONDARY_WINDOW_SECS,
            secondary_min_decisions: DEFAULT_SECONDARY_MIN_DECISIONS,
            secondary_start_agreement: DEFAULT_SECONDARY_START_AGREEMENT,
            secondary_hysteresis_boost: DEFAULT_SECONDARY_HYSTERESIS_BOOST,
            secondary_min_state_secs: DEFAULT_SECONDARY_MIN_STATE_SECS,
            secondary_stop_threshold: DEFAULT_SECONDARY_STOP_THRESHOLD,
            secondary_alone_max_secs: Some(DEFAULT_SECONDARY_ALONE_MAX_SECS),
            min_blocking_secs: DEFAULT_MIN_BLOCKING_SECS,
            reevaluate_interval_ms: DEFAULT_REEVALUATE_INTERVAL_MS,
        }
    }
}

impl FusionConfig {
    pub fn primary_trust_window(&self) -> Duration {
        secs(self.primary_trust_window_secs)
    }

    pub fn secondary_window(&self) -> Duration {
        secs(self.secondary_window_secs)
    }

    pub fn secondary_min_state(&self) -> Duration {
        secs(self.secondary_min_state_secs)
    }

    pub fn secondary_alone_max(&self) -> Option<Duration> {
        self.secondary_alone_max_secs.map(secs)
    }

    pub fn min_blocking(&self) -> Duration {
        secs(self.min_blocking_secs)
    }

    pub fn reevaluate_interval(&self) -> Duration {
        Duration::from_millis(self.reevaluate_interval_ms.max(10))
    }

    /// Agreement needed for secondary to start alone, boosted when not blocking.
    pub fn secondary_start_threshold(&self, currently_blocking: bool) -> f64 {
        let boost = if currently_blocking {
            0.0
        } else {
            self.secondary_hysteresis_boost
        };
        (self.secondary_start_agreement + boost).min(1.0)
    }

    fn validate(&self) -> Result<(), MinusError> {
        if self.primary_stop_threshold == 0 || self.secondary_stop_threshold == 0 {
            return Err(MinusError::Config(
                "fusion stop thresholds must be at least 1".into(),
            ));
        }
        if self.secondary_min_decisions == 0 {
            return Err(MinusError::Config(
                "fusion.secondary_min_decisions must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("primary_trust_window_secs", self.primary_trust_window_secs),
            ("secondary_window_secs", self.secondary_window_secs),
            ("secondary_min_state_secs", self.secondary_min_state_secs),
            ("min_blocking_secs", self.min_blocking_secs),
        ] {
            check_secs(&format!("fusion.{name}"), value)?;
        }
        if let Some(limit) = self.secondary_alone_max_secs {
            check_secs("fusion.secondary_alone_max_secs", limit)?;
        }
        for (name, value) in [
            ("secondary_start_agreement", self.secondary_start_agreement),
            ("secondary_hysteresis_boost", self.secondary_hysteresis_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MinusError::Config(format!(
                    "fusion.{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplerConfig {
    pub endpoint: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failed polls before the track is put in degraded mode.
    pub max_consecutive_failures: u32,
    /// While degraded, how often a probe poll is attempted.
    pub degraded_retry_secs: f64,
    pub enabled: bool,
}

/// Per-track sampler fields as written in the file. Anything left out keeps
/// the track's own default.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SamplerOverrides {
    endpoint: Option<String>,
    poll_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    degraded_retry_secs: Option<f64>,
    enabled: Option<bool>,
}

impl SamplerOverrides {
    fn apply(self, base: SamplerConfig) -> SamplerConfig {
        SamplerConfig {
            endpoint: self.endpoint.unwrap_or(base.endpoint),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            max_consecutive_failures: self
                .max_consecutive_failures
                .unwrap_or(base.max_consecutive_failures),
            degraded_retry_secs: self.degraded_retry_secs.unwrap_or(base.degraded_retry_secs),
            enabled: self.enabled.unwrap_or(base.enabled),
        }
    }
}

fn primary_sampler<'de, D>(deserializer: D) -> Result<SamplerConfig, D::Error>
where
    D: Deserializer<'de>,
{
    SamplerOverrides::deserialize(deserializer).map(|fields| fields.apply(SamplerConfig::primary()))
}

fn secondary_sampler<'de, D>(deserializer: D) -> Result<SamplerConfig, D::Error>
where
    D: Deserializer<'de>,
{
    SamplerOverrides::deserialize(deserializer)
        .map(|fields| fields.apply(SamplerConfig::secondary()))
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::secondary()
    }
}

impl SamplerConfig {
    pub fn primary() -> Self {
        Self {
            endpoint: DEFAULT_PRIMARY_ENDPOINT.to_string(),
            poll_interval_ms: DEFAULT_PRIMARY_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_PRIMARY_TIMEOUT_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            degraded_retry_secs: DEFAULT_DEGRADED_RETRY_SECS,
            enabled: true,
        }
    }

    pub fn secondary() -> Self {
        Self {
            endpoint: DEFAULT_SECONDARY_ENDPOINT.to_string(),
            poll_interval_ms: DEFAULT_SECONDARY_POLL_INTERVAL_MS,
            timeout_ms: DEFAULT_SECONDARY_TIMEOUT_MS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            degraded_retry_secs: DEFAULT_DEGRADED_RETRY_SECS,
            enabled: true,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn degraded_retry(&self) -> Duration {
        secs(self.degraded_retry_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceConfig {
    pub id: String,
    /// Command line that (re)starts the resource. Empty means probe-only.
    #[serde(default)]
    pub command: Vec<String>,
    /// Optional URL that must answer a HEAD request with success.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: f64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: f64,
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: f64,
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: f64,
    #[serde(default = "default_restart_grace_secs")]
    pub restart_grace_secs: f64,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: f64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: f64,
    #[serde(default = "default_reset_after_secs")]
    pub reset_after_secs: f64,
    /// Pause probing while the video source reports no signal.
    #[serde(default)]
    pub requires_signal: bool,
    /// Restarting this resource invalidates in-flight classifier samples.
    #[serde(default)]
    pub invalidates_samples: bool,
}

fn default_probe_interval_secs() -> f64 {
    DEFAULT_PROBE_INTERVAL_SECS
}

fn default_probe_timeout_secs() -> f64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_stall_threshold_secs() -> f64 {
    DEFAULT_STALL_THRESHOLD_SECS
}

fn default_startup_grace_secs() -> f64 {
    DEFAULT_STARTUP_GRACE_SECS
}

fn default_restart_grace_secs() -> f64 {
    DEFAULT_RESTART_GRACE_SECS
}

fn default_base_backoff_secs() -> f64 {
    DEFAULT_BASE_BACKOFF_SECS
}

fn default_max_backoff_secs() -> f64 {
    DEFAULT_MAX_BACKOFF_SECS
}

fn default_reset_after_secs() -> f64 {
    DEFAULT_RESET_AFTER_SECS
}

impl ResourceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: Vec::new(),
            health_url: None,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            stall_threshold_secs: DEFAULT_STALL_THRESHOLD_SECS,
            startup_grace_secs: DEFAULT_STARTUP_GRACE_SECS,
            restart_grace_secs: DEFAULT_RESTART_GRACE_SECS,
            base_backoff_secs: DEFAULT_BASE_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            reset_after_secs: DEFAULT_RESET_AFTER_SECS,
            requires_signal: false,
            invalidates_samples: false,
        }
    }

    /// Capture pipeline (MJPEG snapshot server) and audio passthrough.
    pub fn defaults() -> Vec<Self> {
        let capture = Self {
            command: vec![
                "ustreamer".into(),
                format!("--device={DEFAULT_CAPTURE_DEVICE}"),
                "--port=9090".into(),
                "--host=0.0.0.0".into(),
                "--persistent".into(),
                "--quality=80".into(),
            ],
            health_url: Some(DEFAULT_SNAPSHOT_URL.to_string()),
            stall_threshold_secs: 10.0,
            max_backoff_secs: 30.0,
            reset_after_secs: 10.0,
            requires_signal: true,
            invalidates_samples: true,
            ..Self::new("capture")
        };
        let audio = Self {
            command: vec![
                "gst-launch-1.0".into(),
                "-q".into(),
                "alsasrc".into(),
                "device=hw:4,0".into(),
                "!".into(),
                "audioconvert".into(),
                "!".into(),
                "alsasink".into(),
                "device=hw:0,0".into(),
            ],
            requires_signal: true,
            ..Self::new("audio")
        };
        vec![capture, audio]
    }

    pub fn probe_interval(&self) -> Duration {
        secs(self.probe_interval_secs).max(Duration::from_millis(100))
    }

    pub fn probe_timeout(&self) -> Duration {
        secs(self.probe_timeout_secs).max(Duration::from_millis(10))
    }

    pub fn stall_threshold(&self) -> Duration {
        secs(self.stall_threshold_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        secs(self.startup_grace_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        secs(self.restart_grace_secs)
    }

    pub fn base_backoff(&self) -> Duration {
        secs(self.base_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        secs(self.max_backoff_secs)
    }

    pub fn reset_after(&self) -> Duration {
        secs(self.reset_after_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub snapshot_url: String,
    pub device: String,
    /// Query the capture device for an input signal before sampling.
    pub check_signal: bool,
    pub snapshot_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            snapshot_url: DEFAULT_SNAPSHOT_URL.to_string(),
            device: DEFAULT_CAPTURE_DEVICE.to_string(),
            check_signal: true,
            snapshot_timeout_ms: 1000,
        }
    }
}

/// Commands run for each display/output side effect. `{source}` in
/// `show_blocking` is replaced with the blocking source label.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_blocking: Vec<String>,
    pub show_program: Vec<String>,
    pub mute: Vec<String>,
    pub unmute: Vec<String>,
    /// A hook still running after this long is killed and counts as failed.
    pub hook_timeout_ms: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_blocking: Vec::new(),
            show_program: Vec::new(),
            mute: Vec::new(),
            unmute: Vec::new(),
            hook_timeout_ms: DEFAULT_HOOK_TIMEOUT_MS,
        }
    }
}

impl DisplayConfig {
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms.max(1))
    }
}

/// Suppresses the overlay while the primary track's frames stop changing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StillnessConfig {
    pub enabled: bool,
    /// Normalized mean difference above which two frames count as different.
    pub change_threshold: f64,
    /// Unchanged for this long means the screen is static.
    pub static_after_secs: f64,
    /// ...or unchanged for this many polls in a row.
    pub static_after_polls: u32,
    /// Suppression stays on this long after the screen starts moving again.
    pub dynamic_cooldown_secs: f64,
}

impl Default for StillnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            change_threshold: DEFAULT_SCENE_CHANGE_THRESHOLD,
            static_after_secs: DEFAULT_STATIC_AFTER_SECS,
            static_after_polls: DEFAULT_STATIC_AFTER_POLLS,
            dynamic_cooldown_secs: DEFAULT_DYNAMIC_COOLDOWN_SECS,
        }
    }
}

impl StillnessConfig {
    pub fn static_after(&self) -> Duration {
        secs(self.static_after_secs)
    }

    pub fn dynamic_cooldown(&self) -> Duration {
        secs(self.dynamic_cooldown_secs)
    }

    fn validate(&self) -> Result<(), MinusError> {
        if !(0.0..=1.0).contains(&self.change_threshold) {
            return Err(MinusError::Config(format!(
                "stillness.change_threshold must be within 0.0..=1.0, got {}",
                self.change_threshold
            )));
        }
        if self.static_after_polls == 0 {
            return Err(MinusError::Config(
                "stillness.static_after_polls must be at least 1".into(),
            ));
        }
        check_secs("stillness.static_after_secs", self.static_after_secs)?;
        check_secs("stillness.dynamic_cooldown_secs", self.dynamic_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub max_screenshots: usize,
    pub min_interval_secs: f64,
    pub duplicate_distance: u32,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_screenshots: DEFAULT_MAX_SCREENSHOTS,
            min_interval_secs: DEFAULT_SCREENSHOT_INTERVAL_SECS,
            duplicate_distance: DEFAULT_PHASH_DISTANCE_THRESHOLD,
        }
    }
}

impl ScreenshotConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".minus/screenshots")
        })
    }

    pub fn min_interval(&self) -> Duration {
        secs(self.min_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: DEFAULT_CONTROL_BIND.to_string(),
        }
    }
}

impl ControlConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, MinusError> {
        self.bind.parse().map_err(|err| {
            MinusError::Config(format!("Invalid control.bind `{}`: {err}", self.bind))
        })
    }
}

impl MinusConfig {
    /// Loads config from `path_override`, then `$MINUS_CONFIG`, then
    /// `~/.config/minus.json`. A missing file yields the defaults.
    pub fn load(path_override: Option<&Path>) -> Result<Self, MinusError> {
        let path = match path_override {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };
        let config = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_json(&contents).map_err(|err| {
                MinusError::Config(format!("Failed to parse config {}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound && path_override.is_none() => {
                log::info!("No config at {}, using defaults", path.display());
                Self::with_defaults()
            }
            Err(err) => return Err(MinusError::from(err)),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    pub fn with_defaults() -> Self {
        Self {
            fusion: FusionConfig::default(),
            primary: SamplerConfig::primary(),
            secondary: SamplerConfig::secondary(),
            resources: ResourceConfig::defaults(),
            source: SourceConfig::default(),
            display: DisplayConfig::default(),
            stillness: StillnessConfig::default(),
            screenshots: ScreenshotConfig::default(),
            control: ControlConfig::default(),
        }
    }

    pub fn sampler(&self, track: Track) -> &SamplerConfig {
        match track {
            Track::Primary => &self.primary,
            Track::Secondary => &self.secondary,
        }
    }

    pub fn validate(&self) -> Result<(), MinusError> {
        self.fusion.validate()?;
        validate_url("primary.endpoint", &self.primary.endpoint)?;
        validate_url("secondary.endpoint", &self.secondary.endpoint)?;
        validate_url("source.snapshot_url", &self.source.snapshot_url)?;
        check_secs("primary.degraded_retry_secs", self.primary.degraded_retry_secs)?;
        check_secs("secondary.degraded_retry_secs", self.secondary.degraded_retry_secs)?;
        check_secs("screenshots.min_interval_secs", self.screenshots.min_interval_secs)?;
        self.stillness.validate()?;

        let mut seen = Vec::new();
        for resource in &self.resources {
            if resource.id.trim().is_empty() {
                return Err(MinusError::Config("resource id must not be empty".into()));
            }
            if seen.contains(&resource.id.as_str()) {
                return Err(MinusError::Config(format!(
                    "duplicate resource id `{}`",
                    resource.id
                )));
            }
            seen.push(resource.id.as_str());
            for (name, value) in [
                ("probe_interval_secs", resource.probe_interval_secs),
                ("probe_timeout_secs", resource.probe_timeout_secs),
                ("stall_threshold_secs", resource.stall_threshold_secs),
                ("startup_grace_secs", resource.startup_grace_secs),
                ("restart_grace_secs", resource.restart_grace_secs),
                ("base_backoff_secs", resource.base_backoff_secs),
                ("max_backoff_secs", resource.max_backoff_secs),
                ("reset_after_secs", resource.reset_after_secs),
            ] {
                check_secs(&format!("resources.{}.{name}", resource.id), value)?;
            }
            if let Some(url) = &resource.health_url {
                validate_url(&format!("resources.{}.health_url", resource.id), url)?;
            }
        }
        if self.control.enabled {
            self.control.bind_addr()?;
        }
        Ok(())
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), MinusError> {
    let url = Url::parse(value)
        .map_err(|err| MinusError::Config(format!("Invalid {field} `{value}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(MinusError::Config(format!(
            "Invalid {field} `{value}`: unsupported scheme `{other}`"
        ))),
    }
}

fn config_path() -> Result<PathBuf, MinusError> {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .ok_or_else(|| {
            MinusError::Config(format!(
                "Unable to locate a config directory; set {CONFIG_PATH_ENV}"
            ))
        })?;
    Ok(base.join(CONFIG_FILE_NAME))
}
