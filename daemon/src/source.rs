//! Frame acquisition: the latest captured frame and whether a signal is present.

use std::io;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use log::{info, warn};
use png::{BitDepth, ColorType, Encoder};

use crate::config::SourceConfig;
use crate::error::MinusError;
use crate::tasks::RepeatingTask;

/// Raw RGBA frame grabbed from the capture pipeline.
#[derive(Clone)]
pub struct Frame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn from_image(image: image::DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            rgba: rgba.into_raw(),
            width,
            height,
        }
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, MinusError> {
        let mut buffer = Vec::new();
        {
            let mut encoder = Encoder::new(&mut buffer, self.width, self.height);
            encoder.set_color(ColorType::Rgba);
            encoder.set_depth(BitDepth::Eight);
            let mut writer = encoder.write_header()?;
            writer.write_image_data(&self.rgba)?;
        }
        Ok(buffer)
    }

    pub fn to_image(&self) -> Option<image::DynamicImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.rgba.clone())
            .map(image::DynamicImage::ImageRgba8)
    }
}

pub trait FrameSource: Send + Sync {
    fn signal_present(&self) -> bool;

    fn latest_frame(&self) -> anyhow::Result<Frame>;
}

const SIGNAL_TOOL: &str = "v4l2-ctl";

/// JPEG snapshots from the capture server, signal via V4L2 DV timings.
///
/// Without `v4l2-ctl` on the host the signal is assumed present.
pub struct HttpSnapshotSource {
    snapshot_url: String,
    device: String,
    check_signal: bool,
    signal_tool: String,
    tool_missing: AtomicBool,
    client: reqwest::blocking::Client,
}

impl HttpSnapshotSource {
    pub fn new(config: &SourceConfig) -> Result<Self, MinusError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.snapshot_timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            snapshot_url: config.snapshot_url.clone(),
            device: config.device.clone(),
            check_signal: config.check_signal,
            signal_tool: SIGNAL_TOOL.to_string(),
            tool_missing: AtomicBool::new(false),
            client,
        })
    }
}

impl FrameSource for HttpSnapshotSource {
    fn signal_present(&self) -> bool {
        if !self.check_signal || self.tool_missing.load(Ordering::Relaxed) {
            return true;
        }
        let output = match Command::new(&self.signal_tool)
            .args(["-d", &self.device, "--query-dv-timings"])
            .output()
        {
            Ok(output) => output,
            Err(err) => {
                if !self.tool_missing.swap(true, Ordering::Relaxed) {
                    warn!(
                        "[Sampler] {} unavailable ({err}), assuming signal is present",
                        self.signal_tool
                    );
                }
                return true;
            }
        };
        output.status.success() && parse_dv_timings(&String::from_utf8_lossy(&output.stdout)).is_some()
    }

    fn latest_frame(&self) -> anyhow::Result<Frame> {
        let response = self
            .client
            .get(&self.snapshot_url)
            .send()
            .with_context(|| format!("snapshot request to {} failed", self.snapshot_url))?;
        if !response.status().is_success() {
            bail!("snapshot returned {}", response.status());
        }
        let bytes = response.bytes().context("failed to read snapshot body")?;
        let image = image::load_from_memory(&bytes).context("failed to decode snapshot")?;
        Ok(Frame::from_image(image))
    }
}

/// Active resolution from `v4l2-ctl --query-dv-timings`, if any.
pub fn parse_dv_timings(output: &str) -> Option<(u32, u32)> {
    let mut width = 0;
    let mut height = 0;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse().unwrap_or(0);
        match key.trim() {
            "Active width" => width = value,
            "Active height" => height = value,
            _ => {}
        }
    }
    (width > 0 && height > 0).then_some((width, height))
}

/// Last observed signal presence, shared by samplers and watchdog loops.
#[derive(Clone)]
pub struct SignalState(Arc<AtomicBool>);

impl SignalState {
    pub fn new(present: bool) -> Self {
        Self(Arc::new(AtomicBool::new(present)))
    }

    pub fn present(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Stores the new value; returns true when it changed.
    pub fn set(&self, present: bool) -> bool {
        self.0.swap(present, Ordering::AcqRel) != present
    }
}

/// Polls the source for signal presence and logs changes.
pub fn monitor_signal(
    source: Arc<dyn FrameSource>,
    state: SignalState,
    interval: Duration,
) -> io::Result<RepeatingTask> {
    RepeatingTask::start("minus-signal", interval, move || {
        let present = source.signal_present();
        if state.set(present) {
            if present {
                info!("[Sampler] signal restored");
            } else {
                warn!("[Sampler] signal lost");
            }
        }
    })
}
