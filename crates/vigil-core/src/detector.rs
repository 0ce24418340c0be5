//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the RGB frame into a 640×640 input, decodes the three
//! anchor-free stride heads (8/16/32) into boxes + five landmarks, and
//! suppresses overlaps with NMS.

use crate::types::{BoundingBox, Landmarks};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface into the model dir)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A raw detection before embedding extraction.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Scale and padding applied when fitting the frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let size = SCRFD_INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    /// Model-input coordinates → original frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model. Detections scoring at or below
    /// `confidence_threshold` are discarded.
    pub fn load(model_path: &str, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session,
            confidence_threshold,
            stride_outputs,
        })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(frame.width(), frame.height());
        let input = preprocess(frame, &letterbox);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in
            SCRFD_STRIDES.iter().zip(self.stride_outputs.iter())
        {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(heads.decode(stride, &letterbox, self.confidence_threshold));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox-resize into an NCHW tensor normalized for SCRFD.
fn preprocess(frame: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// Raw head outputs for one stride level.
struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<Detection> {
        let grid_w = SCRFD_INPUT_SIZE as usize / stride;
        let grid_h = SCRFD_INPUT_SIZE as usize / stride;
        let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
        let s = stride as f32;

        let mut out = Vec::new();
        for idx in 0..num_anchors {
            let score = self.scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                continue;
            }
            let Some(d) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let (x1, y1) = letterbox.unmap(cx - d[0] * s, cy - d[1] * s);
            let (x2, y2) = letterbox.unmap(cx + d[2] * s, cy + d[3] * s);

            let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * s, cy + k[i * 2 + 1] * s))
            });

            out.push(Detection {
                bbox: BoundingBox::new(x1, y1, x2, y2),
                confidence: score,
                landmarks,
            });
        }
        out
    }
}

/// Resolve output tensor order by name (`score_8`, `bbox_16`, `kps_32`, ...),
/// falling back to the standard positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

/// Greedy non-maximum suppression. Output is sorted by confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                det(5.0, 5.0, 105.0, 105.0, 0.8),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
                det(200.0, 200.0, 250.0, 250.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap() {
        let lb = Letterbox::fit(1280, 720);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        let (x, y) = lb.unmap(100.0 * 0.5, 50.0 * 0.5 + 140.0);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([255, 0, 128]));
        let lb = Letterbox::fit(64, 32);
        let t = preprocess(&frame, &lb);
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        // top padding band
        assert_eq!(t[[0, 0, 0, 320]], 0.0);
        // image area
        let mid = t[[0, 0, 320, 320]];
        assert!((mid - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 0.02);
        assert!((t[[0, 1, 320, 320]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 0.02);
    }

    #[test]
    fn test_decode_single_anchor() {
        let stride = 32usize;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // cell (x=3, y=2), first anchor
        let idx = (2 * grid + 3) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let heads = StrideHeads { scores: &scores, bboxes: &bboxes, kps: &kps };
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let out = heads.decode(stride, &lb, 0.5);
        assert_eq!(out.len(), 1);
        let b = out[0].bbox;
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (64.0, 32.0, 128.0, 96.0));
        assert_eq!(out[0].landmarks.unwrap()[0], (96.0, 64.0));
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
