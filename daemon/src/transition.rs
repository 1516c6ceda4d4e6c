//! Scene-cut detection for "clear" frames.

use crate::source::Frame;

const BLACK_MEAN: f64 = 30.0;
const UNIFORM_STD_DEV: f64 = 15.0;
const SIMILAR_RANGE: f64 = 20.0;
const SIMILAR_FRACTION: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Black,
    SolidColor,
    Uniform,
}

pub trait TransitionDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Option<TransitionKind>;
}

/// Flags near-uniform frames: black cuts, solid fades, and frames where
/// almost every pixel sits near the median brightness.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformityDetector;

impl TransitionDetector for UniformityDetector {
    fn detect(&self, frame: &Frame) -> Option<TransitionKind> {
        let gray: Vec<f64> = frame
            .rgba
            .chunks_exact(4)
            .map(|px| (px[0] as f64 + px[1] as f64 + px[2] as f64) / 3.0)
            .collect();
        if gray.is_empty() {
            return None;
        }

        let count = gray.len() as f64;
        let mean = gray.iter().sum::<f64>() / count;
        let variance = gray.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / count;
        let std_dev = variance.sqrt();

        if mean < BLACK_MEAN && std_dev < UNIFORM_STD_DEV {
            return Some(TransitionKind::Black);
        }
        if std_dev < UNIFORM_STD_DEV {
            return Some(TransitionKind::SolidColor);
        }

        let median = median(&gray);
        let similar = gray
            .iter()
            .filter(|value| (*value - median).abs() < SIMILAR_RANGE)
            .count() as f64;
        (similar / count > SIMILAR_FRACTION).then_some(TransitionKind::Uniform)
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pixels: impl Iterator<Item = [u8; 3]>) -> Frame {
        let rgba: Vec<u8> = pixels.flat_map(|[r, g, b]| [r, g, b, 255]).collect();
        let width = (rgba.len() / 4) as u32;
        Frame {
            rgba,
            width,
            height: 1,
        }
    }

    #[test]
    fn black_frame() {
        let frame = frame(std::iter::repeat_n([5, 5, 5], 100));
        assert_eq!(UniformityDetector.detect(&frame), Some(TransitionKind::Black));
    }

    #[test]
    fn solid_colour_frame() {
        let frame = frame(std::iter::repeat_n([200, 40, 40], 100));
        assert_eq!(
            UniformityDetector.detect(&frame),
            Some(TransitionKind::SolidColor)
        );
    }

    #[test]
    fn mostly_uniform_frame_with_outliers() {
        // 97 mid-grey pixels, 3 white ones push the std-dev over the solid limit.
        let pixels = std::iter::repeat_n([100, 100, 100], 97).chain(std::iter::repeat_n([255, 255, 255], 3));
        assert_eq!(
            UniformityDetector.detect(&frame(pixels)),
            Some(TransitionKind::Uniform)
        );
    }

    #[test]
    fn real_content_is_not_a_transition() {
        let pixels = (0..100u32).map(|i| {
            let value = (i * 255 / 99) as u8;
            [value, value, value]
        });
        assert_eq!(UniformityDetector.detect(&frame(pixels)), None);
        assert_eq!(UniformityDetector.detect(&frame(std::iter::empty())), None);
    }
}
