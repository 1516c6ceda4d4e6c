use anyhow::Result;

use crate::observation::Verdict;
use crate::source::Frame;

/// Pluggable ad classifier for one track.
pub trait Classifier: Send + Sync {
    /// Label one frame. May block; callers bound it with a deadline.
    fn classify(&self, frame: &Frame) -> Result<Verdict>;
}

mod http;

pub use http::HttpClassifier;
