//! The detector capability: frame in, face observations out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceObservation;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Produces bounding box + embedding for every face in a frame.
///
/// Implementations must be side-effect free with respect to the frame.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError>;
}

/// SCRFD detection followed by ArcFace embedding of each face.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn load(
        scrfd_path: &str,
        arcface_path: &str,
        confidence_threshold: f32,
    ) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(scrfd_path, confidence_threshold)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>, AnalyzerError> {
        let detections = self.detector.detect(frame)?;
        let mut observations = Vec::with_capacity(detections.len());

        for det in detections {
            let embedding = match self.recognizer.extract(frame, det.landmarks.as_ref()) {
                Ok(e) => e,
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = det.confidence, "skipping face without landmarks");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            observations.push(FaceObservation {
                bbox: det.bbox,
                confidence: det.confidence,
                embedding,
                landmarks: det.landmarks,
            });
        }

        Ok(observations)
    }
}
