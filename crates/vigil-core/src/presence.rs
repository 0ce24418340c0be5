//! Per-identity presence tracking.
//!
//! A label is either absent (no record) or present. The first sighting of
//! an absent label starts a visit and is the only capture-worthy event;
//! sightings within the absence timeout extend the visit.

use crate::types::IdentityLabel;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default gap after which a label's visit ends.
pub const DEFAULT_ABSENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bookkeeping for one ongoing visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    /// Start of the current visit (when its evidence photo was taken).
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Outcome of one sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// Absent → present. Capture evidence for this one.
    NewVisit,
    /// Present → present.
    Continuing,
}

impl Sighting {
    pub fn is_capture_worthy(self) -> bool {
        matches!(self, Sighting::NewVisit)
    }
}

#[derive(Debug)]
pub struct PresenceTracker {
    absence_timeout: Duration,
    records: HashMap<IdentityLabel, PresenceRecord>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ABSENCE_TIMEOUT)
    }
}

impl PresenceTracker {
    pub fn new(absence_timeout: Duration) -> Self {
        Self {
            absence_timeout,
            records: HashMap::new(),
        }
    }

    /// Record a sighting of `label` at `now`.
    ///
    /// A record older than the absence timeout counts as a finished visit
    /// even if [`sweep`](Self::sweep) has not run yet.
    pub fn observe(&mut self, label: &IdentityLabel, now: Instant) -> Sighting {
        let timeout = self.absence_timeout;
        match self.records.get_mut(label) {
            Some(rec) if !Self::is_expired(timeout, rec, now) => {
                rec.last_seen = now;
                Sighting::Continuing
            }
            _ => {
                self.records.insert(
                    label.clone(),
                    PresenceRecord {
                        first_seen: now,
                        last_seen: now,
                    },
                );
                Sighting::NewVisit
            }
        }
    }

    /// Evict every label whose last sighting is older than the absence
    /// timeout. Returns the evicted labels.
    pub fn sweep(&mut self, now: Instant) -> Vec<IdentityLabel> {
        let timeout = self.absence_timeout;
        let expired: Vec<IdentityLabel> = self
            .records
            .iter()
            .filter(|(_, rec)| now.saturating_duration_since(rec.last_seen) > timeout)
            .map(|(label, _)| label.clone())
            .collect();
        for label in &expired {
            self.records.remove(label);
        }
        expired
    }

    pub fn is_present(&self, label: &IdentityLabel) -> bool {
        self.records.contains_key(label)
    }

    pub fn record(&self, label: &IdentityLabel) -> Option<&PresenceRecord> {
        self.records.get(label)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every visit, e.g. when a capture run ends.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    fn is_expired(absence_timeout: Duration, rec: &PresenceRecord, now: Instant) -> bool {
        now.saturating_duration_since(rec.last_seen) > absence_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ada() -> IdentityLabel {
        IdentityLabel::Known("ada".into())
    }

    #[test]
    fn test_same_visit_captures_once() {
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::new(secs(5));
        assert_eq!(tracker.observe(&ada(), t0), Sighting::NewVisit);
        tracker.sweep(t0);
        assert_eq!(tracker.observe(&ada(), t0 + secs(1)), Sighting::Continuing);
        tracker.sweep(t0 + secs(1));
        assert_eq!(tracker.record(&ada()).unwrap().first_seen, t0);
    }

    #[test]
    fn test_return_after_timeout_is_new_visit() {
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::new(secs(5));
        assert!(tracker.observe(&ada(), t0).is_capture_worthy());
        // No frames in between: the stale record still ends the visit.
        assert!(tracker.observe(&ada(), t0 + secs(10)).is_capture_worthy());
    }

    #[test]
    fn test_sweep_evicts_absent_labels() {
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::new(secs(5));
        tracker.observe(&ada(), t0);
        tracker.observe(&IdentityLabel::Unrecognized, t0 + secs(3));

        assert!(tracker.sweep(t0 + secs(5)).is_empty());
        assert_eq!(tracker.sweep(t0 + secs(6)), vec![ada()]);
        assert!(!tracker.is_present(&ada()));
        assert!(tracker.is_present(&IdentityLabel::Unrecognized));

        assert_eq!(tracker.observe(&ada(), t0 + secs(7)), Sighting::NewVisit);
    }

    #[test]
    fn test_refresh_extends_visit() {
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::new(secs(5));
        for i in 0..20 {
            let s = tracker.observe(&ada(), t0 + secs(i * 2));
            tracker.sweep(t0 + secs(i * 2));
            assert_eq!(s.is_capture_worthy(), i == 0);
        }
    }

    #[test]
    fn test_labels_are_independent() {
        let t0 = Instant::now();
        let mut tracker = PresenceTracker::default();
        assert!(tracker.observe(&ada(), t0).is_capture_worthy());
        assert!(tracker.observe(&IdentityLabel::Unrecognized, t0).is_capture_worthy());
        assert!(!tracker.observe(&ada(), t0).is_capture_worthy());
        assert_eq!(tracker.len(), 2);
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
