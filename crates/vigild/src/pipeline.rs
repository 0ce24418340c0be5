//! Per-frame coordination and the capture worker loop.
//!
//! One worker thread owns the frame source, the recorder and a [`Pipeline`].
//! Control requests reach it as [`Command`]s, drained between frames.

use crate::config::Config;
use crate::live::{FaceSummary, LiveState};
use crate::outcome::Outcome;
use crate::overlay::Overlay;
use crate::recorder::{ClosedSession, Recorder, StartOutcome};
use crate::registry::{SharedAnalyzer, SharedGallery};
use crate::store::{self, NewDetection, Store};
use chrono::Local;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use vigil_core::{
    AlertPolicy, BoundingBox, CosineMatcher, Embedding, FaceObservation, IdentityLabel, Matcher,
    PresenceTracker, RecordingDecision, RecordingPolicy, SessionOrigin, StopReason,
};
use vigil_hw::{Frame, FrameSource, SinkOpener};

const FPS_WINDOW: u32 = 30;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub detection_interval: u32,
    pub min_face_size: f32,
    pub recognition_threshold: f32,
    pub enable_recognition: bool,
    pub absence_timeout: Duration,
    pub alerts_enabled: bool,
    pub alert_cooldown: Duration,
    pub recording: RecordingPolicy,
    pub video_fps: u32,
    pub recordings_dir: PathBuf,
    pub faces_dir: PathBuf,
    pub evidence_padding: u32,
    pub jpeg_quality: u8,
    pub camera_id: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detection_interval: config.detection_interval.max(1),
            min_face_size: config.face_size_threshold as f32,
            recognition_threshold: config.recognition_threshold,
            enable_recognition: config.enable_recognition,
            absence_timeout: config.absence_timeout(),
            alerts_enabled: config.alerts_enabled(),
            alert_cooldown: config.alert_cooldown(),
            recording: config.recording_policy(),
            video_fps: config.video_fps,
            recordings_dir: config.recordings_dir(),
            faces_dir: config.faces_dir(),
            evidence_padding: config.evidence_padding,
            jpeg_quality: config.jpeg_quality,
            camera_id: config.camera_device.clone(),
        }
    }
}

/// Requests handled by the capture worker between frames.
pub enum Command {
    StartRecording { reply: oneshot::Sender<Outcome> },
    StopRecording { reply: oneshot::Sender<Outcome> },
    Stop,
}

/// Why a capture run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    Stopped,
    EndOfStream,
    SourceFault(String),
}

/// A new visit that warrants an evidence photo and a detection record.
struct Capture {
    identity: IdentityLabel,
    confidence: f32,
    bbox: BoundingBox,
}

/// Frame counter that reports FPS once per window.
struct FpsMeter {
    window_start: Option<Instant>,
    frames: u32,
    fps: f32,
}

impl FpsMeter {
    fn new() -> Self {
        Self {
            window_start: None,
            frames: 0,
            fps: 0.0,
        }
    }

    fn tick(&mut self, now: Instant) -> f32 {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        if self.frames >= FPS_WINDOW {
            let secs = now.saturating_duration_since(start).as_secs_f32();
            if secs > 0.0 {
                self.fps = self.frames as f32 / secs;
            }
            self.window_start = Some(now);
            self.frames = 0;
        }
        self.fps
    }
}

pub struct Pipeline {
    settings: PipelineSettings,
    analyzer: SharedAnalyzer,
    gallery: SharedGallery,
    matcher: Box<dyn Matcher + Send>,
    presence: PresenceTracker,
    alerts: AlertPolicy,
    recorder: Recorder,
    overlay: Overlay,
    store: Arc<Store>,
    live: Arc<LiveState>,
    last_faces: Vec<FaceSummary>,
    frame_index: u64,
    frame_size: Option<(u32, u32)>,
    fps: FpsMeter,
    pending_manual_start: bool,
    /// Set by a manual stop. Detection mode clears it on the first frame
    /// without faces; continuous mode only on a manual start.
    auto_suppressed: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: PipelineSettings,
        analyzer: SharedAnalyzer,
        gallery: SharedGallery,
        sinks: Arc<dyn SinkOpener>,
        overlay: Overlay,
        store: Arc<Store>,
        live: Arc<LiveState>,
    ) -> Self {
        let recorder = Recorder::new(sinks, settings.recordings_dir.clone(), settings.video_fps);
        Self {
            presence: PresenceTracker::new(settings.absence_timeout),
            alerts: AlertPolicy::new(settings.alerts_enabled, settings.alert_cooldown),
            matcher: Box::new(CosineMatcher),
            recorder,
            settings,
            analyzer,
            gallery,
            overlay,
            store,
            live,
            last_faces: Vec::new(),
            frame_index: 0,
            frame_size: None,
            fps: FpsMeter::new(),
            pending_manual_start: false,
            auto_suppressed: false,
        }
    }

    /// Run one frame through detection, presence, recording, overlay and publish.
    pub fn process_frame(&mut self, frame: Frame, now: Instant) {
        let detection_pass = self.frame_index % self.settings.detection_interval as u64 == 0;
        self.frame_index += 1;
        let (width, height) = (frame.width(), frame.height());
        self.frame_size = Some((width, height));

        let mut captures = Vec::new();
        if detection_pass {
            let observations = self.detect(&frame.image);
            let mut faces = Vec::with_capacity(observations.len());
            for obs in observations {
                let (identity, confidence) = self.resolve(&obs.embedding);
                let sighting = self.presence.observe(&identity, now);
                faces.push(FaceSummary::new(obs.bbox, &identity, confidence, obs.landmarks));
                if sighting.is_capture_worthy() {
                    let alert = self.alerts.evaluate(&identity, sighting, now);
                    captures.push((
                        Capture {
                            identity,
                            confidence,
                            bbox: obs.bbox,
                        },
                        alert,
                    ));
                }
            }
            self.last_faces = faces;
        }

        for label in self.presence.sweep(now) {
            tracing::debug!(subject = %label, "visit ended");
        }

        self.apply_recording_policy(width, height, now);

        for (capture, alert) in captures {
            self.record_capture(&frame.image, &capture);
            if let Some(kind) = alert {
                let description = format!(
                    "Unknown person detected at {}",
                    Local::now().format("%H:%M:%S")
                );
                tracing::info!(kind = kind.as_str(), "alert raised");
                store::log_failure(
                    "create alert",
                    self.store
                        .create_alert(kind.as_str(), &capture.identity, &description),
                );
            }
        }

        let fps = self.fps.tick(now);
        let mut annotated = frame.image;
        self.overlay.draw(
            &mut annotated,
            &self.last_faces,
            self.recorder.is_active(),
            fps,
            Local::now(),
        );
        let annotated = Arc::new(annotated);
        self.live
            .publish(Arc::clone(&annotated), self.last_faces.clone(), fps);

        if let Err(e) = self.recorder.write(&annotated) {
            tracing::warn!(error = %e, "encoder write failed; aborting recording");
            self.stop_recording(StopReason::EncoderFault, now);
        }
    }

    /// Detector faults degrade to "no faces this frame".
    fn detect(&self, image: &RgbImage) -> Vec<FaceObservation> {
        let result = {
            let mut analyzer = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            analyzer.analyze(image)
        };
        match result {
            Ok(faces) => faces
                .into_iter()
                .filter(|f| f.bbox.meets_min_size(self.settings.min_face_size))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "detection failed; treating frame as empty");
                Vec::new()
            }
        }
    }

    fn resolve(&self, embedding: &Embedding) -> (IdentityLabel, f32) {
        if !self.settings.enable_recognition {
            return (IdentityLabel::Unrecognized, 0.0);
        }
        let gallery = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        self.matcher
            .best_match(embedding, &gallery, self.settings.recognition_threshold)
            .into_identity()
    }

    fn apply_recording_policy(&mut self, width: u32, height: u32, now: Instant) {
        let has_face = !self.last_faces.is_empty();

        if self.pending_manual_start {
            self.pending_manual_start = false;
            let _ = self.start_recording(SessionOrigin::Manual, width, height, now);
        }
        if self.auto_suppressed && self.settings.recording.on_detection && !has_face {
            self.auto_suppressed = false;
        }

        let decision = self
            .settings
            .recording
            .evaluate(self.recorder.session_info(), has_face, now);
        match decision {
            RecordingDecision::Hold => {}
            RecordingDecision::Start(origin) => {
                if !self.auto_suppressed && self.recorder.may_auto_start(now) {
                    let _ = self.start_recording(origin, width, height, now);
                }
            }
            RecordingDecision::Stop(reason) => {
                self.stop_recording(reason, now);
            }
            RecordingDecision::Rollover => {
                self.stop_recording(StopReason::DurationCap, now);
                let _ = self.start_recording(SessionOrigin::Continuous, width, height, now);
            }
        }
    }

    fn start_recording(
        &mut self,
        origin: SessionOrigin,
        width: u32,
        height: u32,
        now: Instant,
    ) -> Result<StartOutcome, String> {
        match self.recorder.start(origin, width, height, now, &self.live) {
            Ok(StartOutcome::Started(path)) => {
                let name = file_name(&path);
                store::log_failure(
                    "log recording start",
                    self.store.log_system_event(
                        "INFO",
                        &format!("Recording started: {name}"),
                        Some(origin.as_str()),
                    ),
                );
                Ok(StartOutcome::Started(path))
            }
            Ok(already) => Ok(already),
            Err(e) => {
                tracing::warn!(error = %e, origin = origin.as_str(), "could not open encoder");
                store::log_failure(
                    "log encoder failure",
                    self.store
                        .log_system_event("WARNING", "Recording could not start", Some(&e.to_string())),
                );
                Err(e.to_string())
            }
        }
    }

    fn stop_recording(&mut self, reason: StopReason, now: Instant) -> Option<ClosedSession> {
        let closed = self.recorder.stop(reason, now, &self.live)?;
        let details = format!(
            "origin={} reason={} duration={:.1}s frames={}",
            closed.origin.as_str(),
            closed.reason.as_str(),
            closed.duration.as_secs_f32(),
            closed.frames
        );
        store::log_failure(
            "log recording stop",
            self.store.log_system_event(
                if closed.close_error.is_some() { "WARNING" } else { "INFO" },
                &format!("Recording stopped: {}", file_name(&closed.path)),
                Some(&details),
            ),
        );
        Some(closed)
    }

    /// Evidence photo plus detection record for a new visit.
    fn record_capture(&self, image: &RgbImage, capture: &Capture) {
        let evidence = self.save_evidence(image, capture);
        tracing::info!(
            subject = %capture.identity,
            confidence = capture.confidence,
            evidence = ?evidence,
            "new visit"
        );
        store::log_failure(
            "log detection",
            self.store.log_detection(&NewDetection {
                identity: &capture.identity,
                confidence: capture.confidence,
                face_image_path: evidence.as_deref(),
                video_path: self.recorder.current_path(),
                camera_id: &self.settings.camera_id,
            }),
        );
    }

    fn save_evidence(&self, image: &RgbImage, capture: &Capture) -> Option<PathBuf> {
        let (x, y, w, h) =
            capture
                .bbox
                .padded_crop(self.settings.evidence_padding, image.width(), image.height())?;
        let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let path = self
            .settings
            .faces_dir
            .join(format!("{}_{stamp}.jpg", capture.identity.person_id()));

        let written = vigil_hw::frame::encode_jpeg(&crop, self.settings.jpeg_quality)
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
        match written {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not save evidence photo");
                None
            }
        }
    }

    /// Operator start. Idempotent; waits for the first frame when none has
    /// arrived yet.
    pub fn manual_start(&mut self, now: Instant) -> Outcome {
        self.auto_suppressed = false;
        if let Some(path) = self.recorder.current_path() {
            return Outcome::ok("already recording").with_detail(path.to_string_lossy());
        }
        let Some((width, height)) = self.frame_size else {
            self.pending_manual_start = true;
            return Outcome::ok("recording will start with the next frame");
        };
        match self.start_recording(SessionOrigin::Manual, width, height, now) {
            Ok(StartOutcome::Started(path)) => {
                Outcome::ok("recording started").with_detail(path.to_string_lossy())
            }
            Ok(StartOutcome::AlreadyRecording(path)) => {
                Outcome::ok("already recording").with_detail(path.to_string_lossy())
            }
            Err(e) => Outcome::fail(format!("failed to start recording: {e}")),
        }
    }

    /// Operator stop. Idempotent.
    pub fn manual_stop(&mut self, now: Instant) -> Outcome {
        self.pending_manual_start = false;
        match self.stop_recording(StopReason::Manual, now) {
            Some(closed) => {
                if self.settings.recording.enabled {
                    self.auto_suppressed = true;
                }
                Outcome::ok("recording stopped").with_detail(closed.path.to_string_lossy())
            }
            None => Outcome::ok("not recording"),
        }
    }

    /// Close any open session. Runs on every exit path of the worker.
    pub fn shutdown(&mut self, now: Instant) {
        self.stop_recording(StopReason::Shutdown, now);
        self.presence.clear();
        self.last_faces.clear();
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_active()
    }

    fn log_event(&self, level: &str, message: &str, details: Option<&str>) {
        store::log_failure(
            "log system event",
            self.store.log_system_event(level, message, details),
        );
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Handle pending commands. Returns true when the run should stop.
fn drain_commands(pipeline: &mut Pipeline, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(Command::StartRecording { reply }) => {
                let _ = reply.send(pipeline.manual_start(Instant::now()));
            }
            Ok(Command::StopRecording { reply }) => {
                let _ = reply.send(pipeline.manual_stop(Instant::now()));
            }
            Ok(Command::Stop) => return true,
            Err(mpsc::error::TryRecvError::Empty) => return false,
            Err(mpsc::error::TryRecvError::Disconnected) => return true,
        }
    }
}

/// Drive `source` through `pipeline` until stopped, the stream ends, or a
/// read fails. Cleanup closes the recording before releasing the source.
pub fn run_capture(
    mut pipeline: Pipeline,
    mut source: Box<dyn FrameSource>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> RunExit {
    pipeline.log_event("INFO", "Capture started", Some(&pipeline.settings.camera_id));
    tracing::info!(camera = %pipeline.settings.camera_id, "capture loop started");

    let exit = loop {
        if drain_commands(&mut pipeline, &mut commands) {
            break RunExit::Stopped;
        }
        match source.read() {
            Ok(Some(frame)) => pipeline.process_frame(frame, Instant::now()),
            Ok(None) => break RunExit::EndOfStream,
            Err(e) => {
                tracing::error!(error = %e, "frame source failed; ending capture");
                break RunExit::SourceFault(e.to_string());
            }
        }
    };

    pipeline.shutdown(Instant::now());
    source.release();

    let error = match &exit {
        RunExit::SourceFault(e) => {
            pipeline.log_event("ERROR", "Capture ended by source fault", Some(e));
            Some(e.clone())
        }
        RunExit::EndOfStream => {
            pipeline.log_event("INFO", "Capture ended: end of stream", None);
            None
        }
        RunExit::Stopped => {
            pipeline.log_event("INFO", "Capture stopped", None);
            None
        }
    };
    pipeline.live.end_capture(error);
    tracing::info!(exit = ?exit, "capture loop exited");
    exit
}
