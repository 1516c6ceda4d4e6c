//! Static-screen suppression.
//!
//! A paused player or a still landing page can look like an ad to a
//! classifier. When the primary track's frames stop changing, blocking is
//! suppressed until the screen has been moving again for a short cooldown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use log::info;

use crate::config::StillnessConfig;
use crate::source::Frame;

const THUMBNAIL_WIDTH: u32 = 160;
const THUMBNAIL_HEIGHT: u32 = 90;

pub trait SceneChange: Send + Sync {
    /// Normalized difference between two frames, 0.0 for identical up to 1.0.
    fn difference(&self, previous: &Frame, current: &Frame) -> f64;
}

/// Mean absolute grayscale difference of two 160x90 thumbnails.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanDifference;

impl SceneChange for MeanDifference {
    fn difference(&self, previous: &Frame, current: &Frame) -> f64 {
        let (Some(previous), Some(current)) = (thumbnail(previous), thumbnail(current)) else {
            return 1.0;
        };
        let total: u64 = previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .map(|(a, b)| u64::from(a.abs_diff(*b)))
            .sum();
        let pixels = previous.as_raw().len().max(1) as f64;
        total as f64 / pixels / 255.0
    }
}

fn thumbnail(frame: &Frame) -> Option<image::GrayImage> {
    let image = frame.to_image()?;
    Some(
        image
            .resize_exact(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, FilterType::Triangle)
            .to_luma8(),
    )
}

pub struct StillnessTracker {
    config: StillnessConfig,
    scene: Arc<dyn SceneChange>,
    previous: Option<Arc<Frame>>,
    static_since: Option<Instant>,
    static_polls: u32,
    suppressed: bool,
    moving_since: Option<Instant>,
}

impl StillnessTracker {
    pub fn new(config: StillnessConfig, scene: Arc<dyn SceneChange>) -> Self {
        Self {
            config,
            scene,
            previous: None,
            static_since: None,
            static_polls: 0,
            suppressed: false,
            moving_since: None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Compares `frame` with the previous one. Returns the new suppression
    /// state when it flips.
    pub fn observe(&mut self, frame: &Arc<Frame>, now: Instant) -> Option<bool> {
        let changed = match self.previous.replace(Arc::clone(frame)) {
            Some(previous) => {
                self.scene.difference(&previous, frame) > self.config.change_threshold
            }
            None => true,
        };

        if changed {
            if self.suppressed && self.moving_since.is_none() {
                info!(
                    "[Static] screen moving again, cooldown {:.1}s",
                    self.config.dynamic_cooldown().as_secs_f64()
                );
                self.moving_since = Some(now);
            }
            self.static_since = None;
            self.static_polls = 0;
        } else {
            self.static_polls = self.static_polls.saturating_add(1);
            self.static_since.get_or_insert(now);
        }

        let static_for = self
            .static_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        let is_static = self.static_since.is_some()
            && (static_for >= self.config.static_after()
                || self.static_polls >= self.config.static_after_polls);

        if is_static {
            self.moving_since = None;
            if self.suppressed {
                return None;
            }
            info!(
                "[Static] screen static for {:.1}s / {} polls, suppressing blocking",
                static_for.as_secs_f64(),
                self.static_polls
            );
            self.suppressed = true;
            return Some(true);
        }

        let cooled = self.moving_since.is_some_and(|since| {
            now.saturating_duration_since(since) >= self.config.dynamic_cooldown()
        });
        if cooled {
            info!("[Static] cooldown complete, blocking re-enabled");
            self.suppressed = false;
            self.moving_since = None;
            return Some(false);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> Arc<Frame> {
        Arc::new(Frame {
            rgba: [value, value, value, 255].repeat(32 * 18),
            width: 32,
            height: 18,
        })
    }

    fn at(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    fn tracker() -> StillnessTracker {
        StillnessTracker::new(StillnessConfig::default(), Arc::new(MeanDifference))
    }

    #[test]
    fn mean_difference_is_normalized() {
        let scene = MeanDifference;
        assert_eq!(scene.difference(&frame(40), &frame(40)), 0.0);
        assert!(scene.difference(&frame(0), &frame(255)) > 0.99);
    }

    #[test]
    fn unchanged_frames_suppress_after_poll_count() {
        let t0 = Instant::now();
        let mut tracker = tracker();
        let still = frame(80);
        assert_eq!(tracker.observe(&still, t0), None);
        for i in 1..4 {
            assert_eq!(tracker.observe(&still, at(t0, i * 100)), None);
        }
        assert_eq!(tracker.observe(&still, at(t0, 400)), Some(true));
        assert!(tracker.is_suppressed());
        assert_eq!(tracker.observe(&still, at(t0, 500)), None);
    }

    #[test]
    fn unchanged_frames_suppress_after_static_time() {
        let t0 = Instant::now();
        let config = StillnessConfig {
            static_after_polls: 100,
            ..StillnessConfig::default()
        };
        let mut tracker = StillnessTracker::new(config, Arc::new(MeanDifference));
        let still = frame(80);
        tracker.observe(&still, t0);
        assert_eq!(tracker.observe(&still, at(t0, 1000)), None);
        assert_eq!(tracker.observe(&still, at(t0, 3600)), Some(true));
    }

    #[test]
    fn suppression_lifts_only_after_cooldown() {
        let t0 = Instant::now();
        let mut tracker = tracker();
        let still = frame(80);
        for i in 0..5 {
            tracker.observe(&still, at(t0, i * 100));
        }
        assert!(tracker.is_suppressed());

        assert_eq!(tracker.observe(&frame(200), at(t0, 1000)), None);
        assert_eq!(tracker.observe(&frame(20), at(t0, 1200)), None);
        assert!(tracker.is_suppressed());
        assert_eq!(tracker.observe(&frame(220), at(t0, 1500)), Some(false));
        assert!(!tracker.is_suppressed());
    }

    #[test]
    fn moving_screen_never_suppresses() {
        let t0 = Instant::now();
        let mut tracker = tracker();
        for i in 0..20u64 {
            let value = if i % 2 == 0 { 30 } else { 200 };
            assert_eq!(tracker.observe(&frame(value), at(t0, i * 500)), None);
        }
        assert!(!tracker.is_suppressed());
    }
}
