//! Labeled frames saved on positive detections, for later review.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use image_hasher::{HashAlg, HasherConfig, ImageHash};
use log::{debug, warn};

use crate::config::ScreenshotConfig;
use crate::error::MinusError;
use crate::observation::Track;
use crate::source::Frame;

const HASH_RESIZE: u32 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(PathBuf),
    RateLimited,
    Duplicate { distance: u32 },
}

/// Screenshot directory for one track. Owned by that track's sampler.
pub struct ScreenshotStore {
    dir: PathBuf,
    max_screenshots: usize,
    min_interval: Duration,
    duplicate_distance: u32,
    last_saved: Option<Instant>,
    last_hash: Option<ImageHash>,
}

impl ScreenshotStore {
    pub fn new(config: &ScreenshotConfig, track: Track) -> Self {
        Self::in_dir(config.resolved_dir(), config, track)
    }

    pub fn in_dir(root: impl AsRef<Path>, config: &ScreenshotConfig, track: Track) -> Self {
        Self {
            dir: root.as_ref().join(format!("{}_ads", track.as_str())),
            max_screenshots: config.max_screenshots.max(1),
            min_interval: config.min_interval(),
            duplicate_distance: config.duplicate_distance,
            last_saved: None,
            last_hash: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&mut self, frame: &Frame, now: Instant) -> Result<SaveOutcome, MinusError> {
        if self
            .last_saved
            .is_some_and(|last| now.saturating_duration_since(last) < self.min_interval)
        {
            return Ok(SaveOutcome::RateLimited);
        }

        let image = frame
            .to_image()
            .ok_or_else(|| MinusError::ImageEncoding("frame buffer size mismatch".into()))?;
        let hash = perceptual_hash(&image);
        if let Some(previous) = &self.last_hash {
            let distance = previous.dist(&hash);
            if distance <= self.duplicate_distance {
                debug!("[Sampler] skipping near-duplicate screenshot (distance {distance})");
                return Ok(SaveOutcome::Duplicate { distance });
            }
        }

        fs::create_dir_all(&self.dir)?;
        let name = format!("ad_{}.png", Local::now().format("%Y%m%d_%H%M%S_%3f"));
        let path = self.dir.join(name);
        fs::write(&path, frame.encode_png()?)?;

        self.last_saved = Some(now);
        self.last_hash = Some(hash);
        self.prune()?;
        Ok(SaveOutcome::Saved(path))
    }

    /// Keeps only the newest `max_screenshots` files.
    fn prune(&self) -> Result<usize, MinusError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
            .collect();
        if files.len() <= self.max_screenshots {
            return Ok(0);
        }
        // Names embed the timestamp, so lexical order is age order.
        files.sort();
        let excess = files.len() - self.max_screenshots;
        for path in &files[..excess] {
            if let Err(err) = fs::remove_file(path) {
                warn!("Failed to prune {}: {}", path.display(), err);
            }
        }
        Ok(excess)
    }
}

fn perceptual_hash(image: &image::DynamicImage) -> ImageHash {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .hash_size(8, 8)
        .to_hasher();
    let resized = image.resize(HASH_RESIZE, HASH_RESIZE, image::imageops::FilterType::Triangle);
    hasher.hash_image(&resized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(lit: impl Fn(u32, u32) -> bool) -> Frame {
        let size = 64;
        let mut rgba = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let value = if lit(x, y) { 255 } else { 0 };
                rgba.extend_from_slice(&[value, value, value, 255]);
            }
        }
        Frame {
            rgba,
            width: size,
            height: size,
        }
    }

    fn config(min_interval_secs: f64, max_screenshots: usize) -> ScreenshotConfig {
        ScreenshotConfig {
            min_interval_secs,
            max_screenshots,
            ..ScreenshotConfig::default()
        }
    }

    fn png_count(dir: &Path) -> usize {
        fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[test]
    fn saves_into_track_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut store = ScreenshotStore::in_dir(root.path(), &config(5.0, 50), Track::Secondary);
        let outcome = store.save(&pattern(|x, _| x < 32), Instant::now()).unwrap();
        let SaveOutcome::Saved(path) = outcome else {
            panic!("expected a saved screenshot, got {outcome:?}");
        };
        assert!(path.starts_with(root.path().join("secondary_ads")));
        assert!(path.exists());
    }

    #[test]
    fn rate_limits_within_interval() {
        let root = tempfile::tempdir().unwrap();
        let mut store = ScreenshotStore::in_dir(root.path(), &config(5.0, 50), Track::Primary);
        let t0 = Instant::now();
        assert!(matches!(
            store.save(&pattern(|x, _| x < 32), t0).unwrap(),
            SaveOutcome::Saved(_)
        ));
        assert_eq!(
            store
                .save(&pattern(|_, y| y < 32), t0 + Duration::from_secs(2))
                .unwrap(),
            SaveOutcome::RateLimited
        );
        assert!(matches!(
            store
                .save(&pattern(|_, y| y < 32), t0 + Duration::from_secs(6))
                .unwrap(),
            SaveOutcome::Saved(_)
        ));
    }

    #[test]
    fn skips_near_duplicates() {
        let root = tempfile::tempdir().unwrap();
        let mut store = ScreenshotStore::in_dir(root.path(), &config(0.0, 50), Track::Primary);
        let t0 = Instant::now();
        store.save(&pattern(|x, _| x < 32), t0).unwrap();
        assert!(matches!(
            store.save(&pattern(|x, _| x < 32), t0 + Duration::from_secs(1)).unwrap(),
            SaveOutcome::Duplicate { distance: 0 }
        ));
        assert_eq!(png_count(store.dir()), 1);
    }

    #[test]
    fn prunes_to_newest() {
        let root = tempfile::tempdir().unwrap();
        let mut store = ScreenshotStore::in_dir(root.path(), &config(0.0, 2), Track::Primary);
        let t0 = Instant::now();
        let frames = [
            pattern(|x, _| x < 32),
            pattern(|_, y| y < 32),
            pattern(|x, y| (x < 32) == (y < 32)),
        ];
        for (i, frame) in frames.iter().enumerate() {
            store.save(frame, t0 + Duration::from_secs(i as u64)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(png_count(store.dir()), 2);
    }
}
