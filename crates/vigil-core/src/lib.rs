//! vigil-core: face analysis and the surveillance decision policies.
//!
//! Face detection (SCRFD) and embedding (ArcFace) run via ONNX Runtime on
//! the CPU. On top of that sit the pieces that decide what a stream of
//! observations means: gallery matching, per-identity presence, recording
//! lifecycle and unrecognized-person alerting.

pub mod alert;
pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod presence;
pub mod recognizer;
pub mod recording;
pub mod types;

pub use alert::{AlertKind, AlertPolicy};
pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use matcher::{CosineMatcher, Gallery, GalleryError, MatchResult, Matcher};
pub use presence::{PresenceTracker, Sighting};
pub use recording::{RecordingDecision, RecordingPolicy, SessionOrigin, StopReason};
pub use types::{BoundingBox, Embedding, FaceObservation, IdentityLabel, KnownPerson, Landmarks};

use std::path::PathBuf;

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/vigil/models")
}
