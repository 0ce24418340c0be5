//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("source already released")]
    Released,
}

/// A live stream of RGB frames.
///
/// `read` returning `Ok(None)` means the stream ended normally.
pub trait FrameSource {
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;
    fn release(&mut self);
}

/// Opens a fresh [`FrameSource`] for each capture run.
///
/// The source itself is created on the capture thread, so only the opener
/// has to cross threads.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
    fn describe(&self) -> String;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted with BT.601.
    Yuyv,
    /// Motion JPEG, decoded per frame.
    Mjpg,
    /// Packed 24-bit RGB, used as-is.
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"RGB3" => Some(Self::Rgb3),
            _ => None,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera and start streaming at (roughly) the requested mode.
    pub fn open(device_path: &str, width: u32, height: u32, fps: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, MJPG, or RGB3)",
                negotiated.fourcc
            ))
        })?;

        if fps > 0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
                tracing::warn!(fps, error = %e, "could not set frame rate, using driver default");
            }
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;

        Ok(Self {
            device: Some(device),
            stream: Some(stream),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Convert one raw driver buffer to RGB according to the negotiated format.
fn convert(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<image::RgbImage, CameraError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Mjpg => frame::decode_jpeg(buf)
            .map_err(|e| CameraError::CaptureFailed(format!("MJPG decode failed: {e}"))),
        PixelFormat::Rgb3 => {
            let expected = (width * height * 3) as usize;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            image::RgbImage::from_raw(width, height, buf[..expected].to_vec())
                .ok_or_else(|| CameraError::CaptureFailed("RGB3 buffer rejected".into()))
        }
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let stream = self.stream.as_mut().ok_or(CameraError::Released)?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        // MJPG payloads are shorter than the mapped buffer
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let sequence = meta.sequence;
        let rgb = convert(format, width, height, payload)?;

        Ok(Some(Frame::new(rgb, sequence)))
    }

    fn release(&mut self) {
        // Stream must go before the device handle
        if self.stream.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
        self.device.take();
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the configured V4L2 device.
#[derive(Debug, Clone)]
pub struct V4l2Opener {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SourceOpener for V4l2Opener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device, self.width, self.height, self.fps)?;
        Ok(Box::new(camera))
    }

    fn describe(&self) -> String {
        format!("{} {}x{}@{}", self.device, self.width, self.height, self.fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"RGB3")), Some(PixelFormat::Rgb3));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let opener = V4l2Opener {
            device: "/dev/does-not-exist-video".into(),
            width: 640,
            height: 480,
            fps: 30,
        };
        match opener.open() {
            Err(CameraError::DeviceNotFound(path)) => assert!(path.contains("does-not-exist")),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected open to fail"),
        }
    }
}
