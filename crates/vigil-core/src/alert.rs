//! Unrecognized-person alerting.
//!
//! Alerts are gated on the presence tracker's new-visit transition and,
//! per subject, on a cooldown window.

use crate::presence::Sighting;
use crate::types::IdentityLabel;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    UnknownPerson,
}

impl AlertKind {
    /// Persisted alert type.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::UnknownPerson => "UNKNOWN_PERSON",
        }
    }
}

#[derive(Debug)]
pub struct AlertPolicy {
    enabled: bool,
    cooldown: Duration,
    last_alert: HashMap<IdentityLabel, Instant>,
}

impl AlertPolicy {
    pub fn new(enabled: bool, cooldown: Duration) -> Self {
        Self {
            enabled,
            cooldown,
            last_alert: HashMap::new(),
        }
    }

    /// Decide whether this sighting raises an alert, and remember it if so.
    pub fn evaluate(
        &mut self,
        label: &IdentityLabel,
        sighting: Sighting,
        now: Instant,
    ) -> Option<AlertKind> {
        if !self.enabled || label.is_known() || !sighting.is_capture_worthy() {
            return None;
        }

        if let Some(last) = self.last_alert.get(label) {
            if now.saturating_duration_since(*last) < self.cooldown {
                tracing::debug!(subject = %label, "alert suppressed by cooldown");
                return None;
            }
        }

        self.last_alert.insert(label.clone(), now);
        Some(AlertKind::UnknownPerson)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_new_unrecognized_visit_alerts() {
        let mut policy = AlertPolicy::new(true, secs(60));
        let t0 = Instant::now();
        assert_eq!(
            policy.evaluate(&IdentityLabel::Unrecognized, Sighting::NewVisit, t0),
            Some(AlertKind::UnknownPerson)
        );
    }

    #[test]
    fn test_continuing_visit_never_alerts() {
        let mut policy = AlertPolicy::new(true, Duration::ZERO);
        let t0 = Instant::now();
        assert!(policy
            .evaluate(&IdentityLabel::Unrecognized, Sighting::Continuing, t0)
            .is_none());
    }

    #[test]
    fn test_known_person_never_alerts() {
        let mut policy = AlertPolicy::new(true, secs(60));
        let label = IdentityLabel::Known("ada".into());
        assert!(policy.evaluate(&label, Sighting::NewVisit, Instant::now()).is_none());
    }

    #[test]
    fn test_cooldown_suppresses_repeat_visits() {
        let mut policy = AlertPolicy::new(true, secs(60));
        let t0 = Instant::now();
        let unknown = IdentityLabel::Unrecognized;
        assert!(policy.evaluate(&unknown, Sighting::NewVisit, t0).is_some());
        assert!(policy.evaluate(&unknown, Sighting::NewVisit, t0 + secs(10)).is_none());
        assert!(policy.evaluate(&unknown, Sighting::NewVisit, t0 + secs(61)).is_some());
    }

    #[test]
    fn test_disabled_policy() {
        let mut policy = AlertPolicy::new(false, secs(60));
        assert!(policy
            .evaluate(&IdentityLabel::Unrecognized, Sighting::NewVisit, Instant::now())
            .is_none());
    }
}
