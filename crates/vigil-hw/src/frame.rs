//! Frame type and pixel conversions (YUYV to RGB, JPEG encode/decode).

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use std::time::Instant;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buf)
}

/// Decode a JPEG buffer (MJPG camera payload) into RGB.
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// Every 4 bytes [Y0, U, Y1, V] carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1] as f32 - 128.0, chunk[3] as f32 - 128.0);
        for y in [chunk[0], chunk[2]] {
            let c = 1.164 * (y as f32 - 16.0);
            rgb.push((c + 1.596 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c - 0.392 * u - 0.813 * v).round().clamp(0.0, 255.0) as u8);
            rgb.push((c + 2.017 * u).round().clamp(0.0, 255.0) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image codec: {0}")]
    Codec(#[from] image::ImageError),
}
