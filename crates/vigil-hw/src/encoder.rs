//! Video encoder sink backed by an `ffmpeg` child process.
//!
//! Raw RGB24 frames are piped to ffmpeg's stdin; the container and codec
//! are chosen by the output path and the configured codec name.

use image::RgbImage;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use thiserror::Error;

/// Bytes of encoder stderr kept for the exit error.
const STDERR_TAIL: usize = 4096;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("failed to spawn encoder '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("frame is {actual_w}x{actual_h}, sink expects {expected_w}x{expected_h}")]
    DimensionMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },
    #[error("encoder pipe write failed: {0}")]
    Write(std::io::Error),
    #[error("encoder exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("encoder already closed")]
    Closed,
}

/// Destination for the frames of one recording session.
pub trait VideoSink: Send {
    fn write(&mut self, frame: &RgbImage) -> Result<(), EncoderError>;
    /// Flush and finalize the file.
    fn close(self: Box<Self>) -> Result<PathBuf, EncoderError>;
    fn path(&self) -> &Path;
}

/// Creates a sink per recording session.
pub trait SinkOpener: Send + Sync {
    fn open(
        &self,
        path: &Path,
        fps: u32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, EncoderError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegOpener {
    pub ffmpeg: String,
    pub codec: String,
}

impl Default for FfmpegOpener {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            codec: "libx264".into(),
        }
    }
}

impl FfmpegOpener {
    fn args(&self, path: &Path, fps: u32, width: u32, height: u32) -> Vec<String> {
        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-framerate".into(),
            fps.max(1).to_string(),
            "-i".into(),
            "-".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            // yuv420p needs even dimensions
            "-vf".into(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
            path.to_string_lossy().into_owned(),
        ]
    }
}

impl SinkOpener for FfmpegOpener {
    fn open(
        &self,
        path: &Path,
        fps: u32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, EncoderError> {
        let mut child = Command::new(&self.ffmpeg)
            .args(self.args(path, fps, width, height))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stderr = match child.stderr.take().map(drain_stderr).transpose() {
            Ok(stderr) => stderr,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EncoderError::Spawn {
                    program: self.ffmpeg.clone(),
                    source,
                });
            }
        };
        tracing::debug!(path = %path.display(), fps, width, height, "encoder started");

        Ok(Box::new(FfmpegSink {
            child: Some(child),
            stdin,
            stderr,
            path: path.to_path_buf(),
            width,
            height,
        }))
    }
}

/// Read the encoder's stderr until EOF so the child never blocks on a full
/// pipe. Yields the last `STDERR_TAIL` bytes.
fn drain_stderr(mut stderr: ChildStderr) -> std::io::Result<JoinHandle<String>> {
    std::thread::Builder::new()
        .name("vigil-encoder-stderr".into())
        .spawn(move || {
            let mut tail = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match stderr.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&buf[..n]);
                        if tail.len() > STDERR_TAIL {
                            tail.drain(..tail.len() - STDERR_TAIL);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            String::from_utf8_lossy(&tail).trim().to_string()
        })
}

pub struct FfmpegSink {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    path: PathBuf,
    width: u32,
    height: u32,
}

impl FfmpegSink {
    fn finish(&mut self) -> Result<(), EncoderError> {
        // Closing stdin signals EOF so ffmpeg writes the trailer
        drop(self.stdin.take());
        let mut child = self.child.take().ok_or(EncoderError::Closed)?;
        let status = child.wait().map_err(EncoderError::Write)?;
        let stderr = self
            .stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(EncoderError::Exit {
                status: status.to_string(),
                stderr,
            })
        }
    }
}

impl VideoSink for FfmpegSink {
    fn write(&mut self, frame: &RgbImage) -> Result<(), EncoderError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(EncoderError::DimensionMismatch {
                expected_w: self.width,
                expected_h: self.height,
                actual_w: frame.width(),
                actual_h: frame.height(),
            });
        }
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        stdin.write_all(frame.as_raw()).map_err(EncoderError::Write)
    }

    fn close(mut self: Box<Self>) -> Result<PathBuf, EncoderError> {
        self.finish()?;
        Ok(self.path.clone())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.finish() {
                tracing::warn!(path = %self.path.display(), error = %e, "encoder closed on drop");
            }
        }
    }
}
