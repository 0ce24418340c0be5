//! Shared live state: the latest annotated frame plus status, behind one lock.
//!
//! The capture worker is the only writer. Readers clone a snapshot (the frame
//! is reference counted) and never see a half-applied publish.

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vigil_core::{BoundingBox, IdentityLabel, Landmarks};

/// What the overlay and status consumers know about one face.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FaceSummary {
    pub bbox: BoundingBox,
    /// Display label: the known name or "Unknown".
    pub label: String,
    pub known: bool,
    /// Match similarity; 0 for unrecognized faces.
    pub confidence: f32,
    #[serde(skip)]
    pub landmarks: Option<Landmarks>,
}

impl FaceSummary {
    pub fn new(
        bbox: BoundingBox,
        identity: &IdentityLabel,
        confidence: f32,
        landmarks: Option<Landmarks>,
    ) -> Self {
        Self {
            bbox,
            label: identity.to_string(),
            known: identity.is_known(),
            confidence,
            landmarks,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    pub frame: Option<Arc<RgbImage>>,
    /// Increments on every publish.
    pub frame_seq: u64,
    pub faces: Vec<FaceSummary>,
    pub fps: f32,
    pub is_capturing: bool,
    pub is_recording: bool,
    pub recording_path: Option<PathBuf>,
    pub recording_started: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Serializable view for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub is_running: bool,
    pub is_recording: bool,
    pub faces_detected: usize,
    pub faces: Vec<FaceSummary>,
    pub fps: f32,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    pub recording_path: Option<String>,
    pub recording_started: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct LiveState {
    inner: Mutex<LiveSnapshot>,
}

impl LiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the lock across a multi-step transition (recording start/stop).
    pub fn lock(&self) -> MutexGuard<'_, LiveSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the frame and face summaries in one step.
    pub fn publish(&self, frame: impl Into<Arc<RgbImage>>, faces: Vec<FaceSummary>, fps: f32) {
        let frame = frame.into();
        let mut live = self.lock();
        live.frame = Some(frame);
        live.frame_seq = live.frame_seq.wrapping_add(1);
        live.faces = faces;
        live.fps = fps;
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        self.lock().clone()
    }

    pub fn latest_frame(&self) -> Option<Arc<RgbImage>> {
        self.lock().frame.clone()
    }

    /// Latest frame together with its sequence number.
    pub fn latest_frame_seq(&self) -> Option<(u64, Arc<RgbImage>)> {
        let live = self.lock();
        live.frame.clone().map(|f| (live.frame_seq, f))
    }

    pub fn is_capturing(&self) -> bool {
        self.lock().is_capturing
    }

    pub fn is_recording(&self) -> bool {
        self.lock().is_recording
    }

    /// Mark a capture run as started, clearing the previous run's leftovers.
    pub fn begin_capture(&self) {
        let mut live = self.lock();
        live.is_capturing = true;
        live.last_error = None;
        live.fps = 0.0;
    }

    /// Mark the capture run as over and drop the stale frame.
    pub fn end_capture(&self, error: Option<String>) {
        let mut live = self.lock();
        live.is_capturing = false;
        live.frame = None;
        live.faces.clear();
        live.fps = 0.0;
        live.last_error = error;
    }

    pub fn status(&self) -> LiveStatus {
        let live = self.lock();
        LiveStatus {
            is_running: live.is_capturing,
            is_recording: live.is_recording,
            faces_detected: live.faces.len(),
            faces: live.faces.clone(),
            fps: live.fps,
            frame_width: live.frame.as_ref().map(|f| f.width()),
            frame_height: live.frame.as_ref().map(|f| f.height()),
            recording_path: live
                .recording_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            recording_started: live.recording_started.map(|t| t.to_rfc3339()),
            last_error: live.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_publish_replaces_snapshot() {
        let live = LiveState::new();
        assert!(live.latest_frame().is_none());

        let face = FaceSummary::new(
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            &IdentityLabel::Known("alice".into()),
            0.8,
            None,
        );
        live.publish(RgbImage::new(4, 3), vec![face], 12.5);

        let snap = live.snapshot();
        assert_eq!(snap.frame_seq, 1);
        assert_eq!(snap.frame.as_ref().map(|f| f.dimensions()), Some((4, 3)));
        assert_eq!(snap.faces[0].label, "alice");

        live.publish(RgbImage::new(4, 3), Vec::new(), 13.0);
        let status = live.status();
        assert_eq!(status.faces_detected, 0);
        assert_eq!(status.frame_width, Some(4));
        assert!((status.fps - 13.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_label_display() {
        let s = FaceSummary::new(
            BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            &IdentityLabel::Unrecognized,
            0.0,
            None,
        );
        assert_eq!(s.label, "Unknown");
        assert!(!s.known);
    }

    #[test]
    fn test_end_capture_clears_frame() {
        let live = LiveState::new();
        live.begin_capture();
        live.publish(RgbImage::new(2, 2), Vec::new(), 1.0);
        live.end_capture(Some("read failed".into()));
        let snap = live.snapshot();
        assert!(!snap.is_capturing);
        assert!(snap.frame.is_none());
        assert_eq!(snap.last_error.as_deref(), Some("read failed"));
    }

    #[test]
    fn test_readers_never_see_torn_publish() {
        // Each publish pairs a frame width with a face count; a reader
        // must always see the pair that was written together.
        let live = Arc::new(LiveState::new());
        let writer = {
            let live = Arc::clone(&live);
            thread::spawn(move || {
                for n in 1..200u32 {
                    let faces = (0..n % 5)
                        .map(|_| {
                            FaceSummary::new(
                                BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                                &IdentityLabel::Unrecognized,
                                0.0,
                                None,
                            )
                        })
                        .collect();
                    live.publish(RgbImage::new(n % 5 + 1, 1), faces, 0.0);
                }
            })
        };

        for _ in 0..500 {
            let snap = live.snapshot();
            if let Some(frame) = &snap.frame {
                assert_eq!(frame.width() as usize, snap.faces.len() + 1);
            }
        }
        writer.join().unwrap();
    }
}
