use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned face box in frame pixel coordinates (x1, y1) – (x2, y2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// True when both sides are at least `min_side` pixels.
    pub fn meets_min_size(&self, min_side: f32) -> bool {
        self.width() >= min_side && self.height() >= min_side
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer crop rectangle `(x, y, width, height)` grown by `pad` pixels on
    /// every side and clamped to a `frame_w` × `frame_h` frame.
    ///
    /// Returns `None` when the clamped rectangle is empty.
    pub fn padded_crop(&self, pad: u32, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        let pad = pad as f32;
        let x1 = (self.x1 - pad).max(0.0) as u32;
        let y1 = (self.y1 - pad).max(0.0) as u32;
        let x2 = ((self.x2 + pad).max(0.0) as u32).min(frame_w);
        let y2 = ((self.y2 + pad).max(0.0) as u32).min(frame_h);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Malformed pairs (empty, mismatched length, zero norm, non-finite
    /// components) score 0.0 so they can never clear a positive threshold.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = if denom > 0.0 { dot / denom } else { 0.0 };
        if sim.is_finite() {
            sim.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Little-endian f32 byte encoding used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode from [`to_le_bytes`](Self::to_le_bytes). Returns `None` if the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// One face found by a detection pass.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    /// Detector score for this box.
    pub confidence: f32,
    pub embedding: Embedding,
    pub landmarks: Option<Landmarks>,
}

/// Who a face was resolved to.
///
/// Unrecognized is its own tag: "no name" is reserved for "no detections".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityLabel {
    Known(String),
    Unrecognized,
}

impl IdentityLabel {
    /// Persisted person id: the known name, or `"unknown"`.
    pub fn person_id(&self) -> &str {
        match self {
            IdentityLabel::Known(name) => name,
            IdentityLabel::Unrecognized => "unknown",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            IdentityLabel::Known(name) => Some(name),
            IdentityLabel::Unrecognized => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, IdentityLabel::Known(_))
    }
}

impl fmt::Display for IdentityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityLabel::Known(name) => f.write_str(name),
            IdentityLabel::Unrecognized => f.write_str("Unknown"),
        }
    }
}

/// A registered identity in the gallery.
#[derive(Debug, Clone)]
pub struct KnownPerson {
    pub name: String,
    pub embedding: Embedding,
    pub image_path: Option<PathBuf>,
}
