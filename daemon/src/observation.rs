use std::fmt;
use std::time::{Duration, Instant};

/// One of the two independent ad-detection signal sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    /// Low latency, authoritative (on-screen text keywords).
    Primary,
    /// Higher latency, contextual (visual understanding), needs corroboration.
    Secondary,
}

impl Track {
    pub const ALL: [Track; 2] = [Track::Primary, Track::Secondary];

    pub fn as_str(self) -> &'static str {
        match self {
            Track::Primary => "primary",
            Track::Secondary => "secondary",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classifier's answer for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub is_ad: bool,
    pub confidence: Option<f32>,
}

impl Verdict {
    pub fn ad() -> Self {
        Self {
            is_ad: true,
            confidence: None,
        }
    }

    pub fn clear() -> Self {
        Self {
            is_ad: false,
            confidence: None,
        }
    }
}

/// One completed classifier poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierObservation {
    pub source: Track,
    pub is_ad: bool,
    pub timestamp: Instant,
    pub confidence: Option<f32>,
    pub latency: Duration,
    /// Timeout or error. Failed observations never move any counter.
    pub failed: bool,
    /// The frame looked like a cut between two pieces of content.
    pub transition_frame: bool,
}

impl ClassifierObservation {
    pub fn new(source: Track, verdict: Verdict, timestamp: Instant, latency: Duration) -> Self {
        Self {
            source,
            is_ad: verdict.is_ad,
            timestamp,
            confidence: verdict.confidence,
            latency,
            failed: false,
            transition_frame: false,
        }
    }

    pub fn failed(source: Track, timestamp: Instant, latency: Duration) -> Self {
        Self {
            source,
            is_ad: false,
            timestamp,
            confidence: None,
            latency,
            failed: true,
            transition_frame: false,
        }
    }

    pub fn with_transition(mut self, transition_frame: bool) -> Self {
        self.transition_frame = transition_frame;
        self
    }
}

/// Which track(s) triggered the current blocking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingSource {
    #[default]
    None,
    Primary,
    Secondary,
    Both,
}

impl BlockingSource {
    pub fn includes(self, track: Track) -> bool {
        matches!(
            (self, track),
            (BlockingSource::Both, _)
                | (BlockingSource::Primary, Track::Primary)
                | (BlockingSource::Secondary, Track::Secondary)
        )
    }

    /// Adds a track to the source set. Sources only ever widen.
    pub fn with(self, track: Track) -> Self {
        match (self, track) {
            (BlockingSource::None, Track::Primary) => BlockingSource::Primary,
            (BlockingSource::None, Track::Secondary) => BlockingSource::Secondary,
            (BlockingSource::Primary, Track::Secondary)
            | (BlockingSource::Secondary, Track::Primary) => BlockingSource::Both,
            (current, _) => current,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BlockingSource::None => "none",
            BlockingSource::Primary => "primary",
            BlockingSource::Secondary => "secondary",
            BlockingSource::Both => "both",
        }
    }
}

impl fmt::Display for BlockingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_upgrades_but_never_narrows() {
        let source = BlockingSource::None.with(Track::Primary);
        assert_eq!(source, BlockingSource::Primary);
        let source = source.with(Track::Secondary);
        assert_eq!(source, BlockingSource::Both);
        assert_eq!(source.with(Track::Primary), BlockingSource::Both);
        assert!(source.includes(Track::Primary));
        assert!(!BlockingSource::Secondary.includes(Track::Primary));
    }
}
