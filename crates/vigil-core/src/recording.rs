//! Recording lifecycle policy.
//!
//! Pure decision logic: given the current session (if any), whether the
//! frame holds a size-qualifying face, and the time, decide whether to
//! start, keep, stop or roll over the recording. The encoder itself is
//! owned by the daemon.

use std::time::{Duration, Instant};

/// Why a session was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Opened by a frame with a qualifying face.
    Detection,
    /// Opened by an operator command.
    Manual,
    /// Always-on recording (recording enabled, not tied to detections).
    Continuous,
}

impl SessionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionOrigin::Detection => "detection",
            SessionOrigin::Manual => "manual",
            SessionOrigin::Continuous => "continuous",
        }
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Inactivity,
    DurationCap,
    Manual,
    Shutdown,
    EncoderFault,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Inactivity => "inactivity",
            StopReason::DurationCap => "duration cap",
            StopReason::Manual => "manual",
            StopReason::Shutdown => "shutdown",
            StopReason::EncoderFault => "encoder fault",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingDecision {
    /// Leave the current state as it is.
    Hold,
    Start(SessionOrigin),
    Stop(StopReason),
    /// Close the current file and immediately open the next one.
    Rollover,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordingPolicy {
    /// Master switch for automatic recording.
    pub enabled: bool,
    /// Start on qualifying faces rather than recording continuously.
    pub on_detection: bool,
    /// Minimum session age before an empty frame may stop it.
    pub grace: Duration,
    /// Hard cap on a single session.
    pub max_duration: Duration,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            on_detection: true,
            grace: Duration::from_secs(5),
            max_duration: Duration::from_secs(300),
        }
    }
}

impl RecordingPolicy {
    /// Decide what to do with the recording for this frame.
    ///
    /// `session` is the origin and start time of the active session, if any.
    pub fn evaluate(
        &self,
        session: Option<(SessionOrigin, Instant)>,
        has_qualifying_face: bool,
        now: Instant,
    ) -> RecordingDecision {
        let Some((origin, started)) = session else {
            return match (self.enabled, self.on_detection) {
                (true, true) if has_qualifying_face => {
                    RecordingDecision::Start(SessionOrigin::Detection)
                }
                (true, false) => RecordingDecision::Start(SessionOrigin::Continuous),
                _ => RecordingDecision::Hold,
            };
        };

        let elapsed = now.saturating_duration_since(started);

        if origin == SessionOrigin::Detection && !has_qualifying_face && elapsed > self.grace {
            return RecordingDecision::Stop(StopReason::Inactivity);
        }

        if elapsed > self.max_duration {
            return if origin == SessionOrigin::Continuous {
                RecordingDecision::Rollover
            } else {
                RecordingDecision::Stop(StopReason::DurationCap)
            };
        }

        RecordingDecision::Hold
    }
}
