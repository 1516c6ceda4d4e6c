use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryDecision {
    pub at: Instant,
    pub is_ad: bool,
}

/// Agreement of the secondary decisions currently inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Agreement {
    pub ad_ratio: f64,
    pub total: usize,
}

/// Time-ordered, age-bounded history of secondary decisions.
#[derive(Debug, Clone)]
pub struct SecondaryWindow {
    span: Duration,
    entries: VecDeque<SecondaryDecision>,
}

impl SecondaryWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            entries: VecDeque::new(),
        }
    }

    /// Drops every entry older than the window relative to `now`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.at) > self.span {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn push(&mut self, decision: SecondaryDecision) {
        // Keep time order even if a late sample carries an older timestamp.
        let position = self
            .entries
            .iter()
            .rposition(|entry| entry.at <= decision.at)
            .map_or(0, |idx| idx + 1);
        self.entries.insert(position, decision);
    }

    pub fn agreement(&self) -> Agreement {
        let total = self.entries.len();
        if total == 0 {
            return Agreement::default();
        }
        let ads = self.entries.iter().filter(|entry| entry.is_ad).count();
        Agreement {
            ad_ratio: ads as f64 / total as f64,
            total,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest(&self) -> Option<Instant> {
        self.entries.front().map(|entry| entry.at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(at: Instant, is_ad: bool) -> SecondaryDecision {
        SecondaryDecision { at, is_ad }
    }

    #[test]
    fn prunes_entries_older_than_span() {
        let t0 = Instant::now();
        let mut window = SecondaryWindow::new(Duration::from_secs(45));
        window.push(decision(t0, true));
        window.push(decision(t0 + Duration::from_secs(30), false));
        window.prune(t0 + Duration::from_secs(46));
        assert_eq!(window.len(), 1);
        assert_eq!(window.oldest(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn agreement_is_fraction_of_ads() {
        let t0 = Instant::now();
        let mut window = SecondaryWindow::new(Duration::from_secs(45));
        for (i, is_ad) in [true, true, true, false].into_iter().enumerate() {
            window.push(decision(t0 + Duration::from_secs(i as u64), is_ad));
        }
        let agreement = window.agreement();
        assert_eq!(agreement.total, 4);
        assert!((agreement.ad_ratio - 0.75).abs() < 1e-9);
    }

    #[test]
    fn out_of_order_push_keeps_time_order() {
        let t0 = Instant::now();
        let mut window = SecondaryWindow::new(Duration::from_secs(45));
        window.push(decision(t0 + Duration::from_secs(5), true));
        window.push(decision(t0, false));
        assert_eq!(window.oldest(), Some(t0));
    }
}
