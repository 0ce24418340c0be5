//! The recording session: at most one open encoder per stream.
//!
//! Transitions hold the live-state lock for their whole duration so a reader
//! never sees `is_recording` disagree with the encoder handle.

use crate::live::LiveState;
use chrono::{DateTime, Local};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil_core::{SessionOrigin, StopReason};
use vigil_hw::{EncoderError, SinkOpener, VideoSink};

/// How long automatic starts are held off after the encoder failed to open
/// or died mid-session.
pub const OPEN_RETRY_BACKOFF: Duration = Duration::from_secs(5);

struct ActiveSession {
    sink: Box<dyn VideoSink>,
    origin: SessionOrigin,
    started: Instant,
    path: PathBuf,
    frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(PathBuf),
    AlreadyRecording(PathBuf),
}

/// A session that has just been closed.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub path: PathBuf,
    pub origin: SessionOrigin,
    pub reason: StopReason,
    pub duration: Duration,
    pub frames: u64,
    /// Encoder error raised while finalizing, if any.
    pub close_error: Option<String>,
}

pub struct Recorder {
    opener: Arc<dyn SinkOpener>,
    dir: PathBuf,
    fps: u32,
    session: Option<ActiveSession>,
    retry_after: Option<Instant>,
}

impl Recorder {
    pub fn new(opener: Arc<dyn SinkOpener>, dir: PathBuf, fps: u32) -> Self {
        Self {
            opener,
            dir,
            fps,
            session: None,
            retry_after: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Origin and start time of the open session.
    pub fn session_info(&self) -> Option<(SessionOrigin, Instant)> {
        self.session.as_ref().map(|s| (s.origin, s.started))
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    /// False while backing off after an encoder failure.
    pub fn may_auto_start(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |t| now >= t)
    }

    /// Open a new session unless one is already open.
    pub fn start(
        &mut self,
        origin: SessionOrigin,
        width: u32,
        height: u32,
        now: Instant,
        live: &LiveState,
    ) -> Result<StartOutcome, EncoderError> {
        let mut state = live.lock();
        if let Some(active) = &self.session {
            return Ok(StartOutcome::AlreadyRecording(active.path.clone()));
        }

        let started_at = Local::now();
        let path = self.next_path(&started_at);
        let sink = match self.opener.open(&path, self.fps, width, height) {
            Ok(sink) => sink,
            Err(e) => {
                self.retry_after = Some(now + OPEN_RETRY_BACKOFF);
                return Err(e);
            }
        };
        self.retry_after = None;

        state.is_recording = true;
        state.recording_path = Some(path.clone());
        state.recording_started = Some(started_at);
        self.session = Some(ActiveSession {
            sink,
            origin,
            started: now,
            path: path.clone(),
            frames: 0,
        });
        drop(state);

        tracing::info!(path = %path.display(), origin = origin.as_str(), "recording started");
        Ok(StartOutcome::Started(path))
    }

    /// Close the open session, if any. The session is gone afterwards even
    /// when the encoder reports an error while finalizing.
    pub fn stop(&mut self, reason: StopReason, now: Instant, live: &LiveState) -> Option<ClosedSession> {
        let mut state = live.lock();
        let active = self.session.take()?;
        if reason == StopReason::EncoderFault {
            self.retry_after = Some(now + OPEN_RETRY_BACKOFF);
        }

        let close_error = active.sink.close().err().map(|e| e.to_string());
        state.is_recording = false;
        state.recording_path = None;
        state.recording_started = None;
        drop(state);

        let closed = ClosedSession {
            path: active.path,
            origin: active.origin,
            reason,
            duration: now.saturating_duration_since(active.started),
            frames: active.frames,
            close_error,
        };
        match &closed.close_error {
            None => tracing::info!(
                path = %closed.path.display(),
                reason = reason.as_str(),
                secs = closed.duration.as_secs_f32(),
                frames = closed.frames,
                "recording stopped"
            ),
            Some(e) => tracing::warn!(
                path = %closed.path.display(),
                reason = reason.as_str(),
                error = %e,
                "recording closed with encoder error"
            ),
        }
        Some(closed)
    }

    /// Append a frame to the open session. No-op when idle.
    pub fn write(&mut self, frame: &RgbImage) -> Result<(), EncoderError> {
        if let Some(active) = self.session.as_mut() {
            active.sink.write(frame)?;
            active.frames += 1;
        }
        Ok(())
    }

    fn next_path(&self, started_at: &DateTime<Local>) -> PathBuf {
        let stem = format!("recording_{}", started_at.format("%Y%m%d_%H%M%S"));
        let mut path = self.dir.join(format!("{stem}.mp4"));
        // Rollover can land in the same second as the previous file
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.mp4"));
            n += 1;
        }
        path
    }
}
