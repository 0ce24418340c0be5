//! vigil-hw: frame sources and sinks.
//!
//! V4L2 capture delivering RGB frames, JPEG helpers, and the video encoder
//! sink that recordings are written through.

pub mod camera;
pub mod encoder;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat, SourceOpener, V4l2Opener};
pub use encoder::{EncoderError, FfmpegOpener, FfmpegSink, SinkOpener, VideoSink};
pub use frame::{Frame, FrameError};
