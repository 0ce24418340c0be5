use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use vigil_core::RecordingPolicy;

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file named by `VIGIL_CONFIG`,
/// then `VIGIL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    pub camera_fps: u32,

    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Minimum detector score for a face box.
    pub detection_confidence: f32,
    /// Minimum face box side, in pixels, for a face to count at all.
    pub face_size_threshold: u32,
    /// Run detection on every Nth frame.
    pub detection_interval: u32,
    /// Cosine similarity a gallery entry must exceed to be a match.
    pub recognition_threshold: f32,
    pub enable_recognition: bool,

    pub enable_recording: bool,
    pub record_on_detection: bool,
    pub recording_grace_secs: u64,
    pub max_recording_secs: u64,
    pub video_fps: u32,
    pub video_codec: String,
    pub ffmpeg_path: String,

    /// Seconds without a sighting before a visit ends.
    pub absence_timeout_secs: u64,

    pub enable_alerts: bool,
    pub unknown_face_alert: bool,
    pub alert_cooldown_secs: u64,

    /// Root for recordings, evidence photos, known faces and the database.
    pub data_dir: PathBuf,
    /// SQLite database; `<data_dir>/surveillance.db` when unset.
    pub db_path: Option<PathBuf>,

    pub http_listen: SocketAddr,
    /// Sampling period of the multipart stream.
    pub stream_interval_ms: u64,
    /// TTF/OTF font for overlay text. Boxes are drawn either way.
    pub overlay_font: Option<PathBuf>,
    /// Pixels added around a face box when cropping evidence photos.
    pub evidence_padding: u32,
    pub jpeg_quality: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".into(),
            camera_width: 1280,
            camera_height: 720,
            camera_fps: 30,
            model_dir: vigil_core::default_model_dir(),
            detection_confidence: 0.5,
            face_size_threshold: 30,
            detection_interval: 1,
            recognition_threshold: 0.6,
            enable_recognition: true,
            enable_recording: true,
            record_on_detection: true,
            recording_grace_secs: 5,
            max_recording_secs: 300,
            video_fps: 20,
            video_codec: "libx264".into(),
            ffmpeg_path: "ffmpeg".into(),
            absence_timeout_secs: 5,
            enable_alerts: true,
            unknown_face_alert: true,
            alert_cooldown_secs: 60,
            data_dir: default_data_dir(),
            db_path: None,
            http_listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            stream_interval_ms: 33,
            overlay_font: None,
            evidence_padding: 20,
            jpeg_quality: 85,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

impl Config {
    /// Load defaults, the optional `VIGIL_CONFIG` file, then the environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("VIGIL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Overlay `VIGIL_*` values. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_string(&lookup, "VIGIL_CAMERA_DEVICE", &mut self.camera_device);
        override_parsed(&lookup, "VIGIL_CAMERA_WIDTH", &mut self.camera_width);
        override_parsed(&lookup, "VIGIL_CAMERA_HEIGHT", &mut self.camera_height);
        override_parsed(&lookup, "VIGIL_CAMERA_FPS", &mut self.camera_fps);
        override_parsed(&lookup, "VIGIL_MODEL_DIR", &mut self.model_dir);
        override_parsed(&lookup, "VIGIL_DETECTION_CONFIDENCE", &mut self.detection_confidence);
        override_parsed(&lookup, "VIGIL_FACE_SIZE_THRESHOLD", &mut self.face_size_threshold);
        override_parsed(&lookup, "VIGIL_DETECTION_INTERVAL", &mut self.detection_interval);
        override_parsed(&lookup, "VIGIL_RECOGNITION_THRESHOLD", &mut self.recognition_threshold);
        override_flag(&lookup, "VIGIL_ENABLE_RECOGNITION", &mut self.enable_recognition);
        override_flag(&lookup, "VIGIL_ENABLE_RECORDING", &mut self.enable_recording);
        override_flag(&lookup, "VIGIL_RECORD_ON_DETECTION", &mut self.record_on_detection);
        override_parsed(&lookup, "VIGIL_RECORDING_GRACE_SECS", &mut self.recording_grace_secs);
        override_parsed(&lookup, "VIGIL_MAX_RECORDING_SECS", &mut self.max_recording_secs);
        override_parsed(&lookup, "VIGIL_VIDEO_FPS", &mut self.video_fps);
        override_string(&lookup, "VIGIL_VIDEO_CODEC", &mut self.video_codec);
        override_string(&lookup, "VIGIL_FFMPEG_PATH", &mut self.ffmpeg_path);
        override_parsed(&lookup, "VIGIL_ABSENCE_TIMEOUT_SECS", &mut self.absence_timeout_secs);
        override_flag(&lookup, "VIGIL_ENABLE_ALERTS", &mut self.enable_alerts);
        override_flag(&lookup, "VIGIL_UNKNOWN_FACE_ALERT", &mut self.unknown_face_alert);
        override_parsed(&lookup, "VIGIL_ALERT_COOLDOWN_SECS", &mut self.alert_cooldown_secs);
        override_parsed(&lookup, "VIGIL_DATA_DIR", &mut self.data_dir);
        override_parsed(&lookup, "VIGIL_HTTP_LISTEN", &mut self.http_listen);
        override_parsed(&lookup, "VIGIL_STREAM_INTERVAL_MS", &mut self.stream_interval_ms);
        override_parsed(&lookup, "VIGIL_EVIDENCE_PADDING", &mut self.evidence_padding);
        override_parsed(&lookup, "VIGIL_JPEG_QUALITY", &mut self.jpeg_quality);

        if let Some(v) = lookup("VIGIL_DB_PATH") {
            self.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("VIGIL_OVERLAY_FONT") {
            self.overlay_font = Some(PathBuf::from(v));
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("surveillance.db"))
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    pub fn known_faces_dir(&self) -> PathBuf {
        self.data_dir.join("known_faces")
    }

    /// Create the data directory tree.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.recordings_dir(),
            self.faces_dir(),
            self.known_faces_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn recording_policy(&self) -> RecordingPolicy {
        RecordingPolicy {
            enabled: self.enable_recording,
            on_detection: self.record_on_detection,
            grace: Duration::from_secs(self.recording_grace_secs),
            max_duration: Duration::from_secs(self.max_recording_secs),
        }
    }

    pub fn absence_timeout(&self) -> Duration {
        Duration::from_secs(self.absence_timeout_secs)
    }

    /// Unknown-person alerts need both switches on.
    pub fn alerts_enabled(&self) -> bool {
        self.enable_alerts && self.unknown_face_alert
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms.max(1))
    }
}

fn override_string(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut String) {
    if let Some(v) = get(key) {
        *slot = v;
    }
}

fn override_parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = get(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable config override"),
        }
    }
}

fn override_flag(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(v) = get(key) {
        *slot = !matches!(v.trim(), "0" | "false" | "no" | "off");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.camera_device, "/dev/video0");
        assert_eq!((c.camera_width, c.camera_height), (1280, 720));
        assert_eq!(c.max_recording_secs, 300);
        assert_eq!(c.absence_timeout(), Duration::from_secs(5));
        assert!((c.recognition_threshold - 0.6).abs() < 1e-6);
        assert_eq!(c.http_listen.port(), 5000);
        assert!(c.db_path().ends_with("surveillance.db"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("VIGIL_CAMERA_DEVICE", "/dev/video4"),
            ("VIGIL_DETECTION_INTERVAL", "3"),
            ("VIGIL_ENABLE_ALERTS", "0"),
            ("VIGIL_RECOGNITION_THRESHOLD", "not-a-number"),
            ("VIGIL_DB_PATH", "/var/lib/vigil/x.db"),
        ]
        .into_iter()
        .collect();

        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(c.camera_device, "/dev/video4");
        assert_eq!(c.detection_interval, 3);
        assert!(!c.enable_alerts);
        assert!(!c.alerts_enabled());
        // Bad value keeps the default
        assert!((c.recognition_threshold - 0.6).abs() < 1e-6);
        assert_eq!(c.db_path(), PathBuf::from("/var/lib/vigil/x.db"));
    }

    #[test]
    fn test_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(
            &path,
            "camera_fps = 15\nrecord_on_detection = false\nhttp_listen = \"0.0.0.0:8080\"\n",
        )
        .unwrap();

        let c = Config::from_file(&path).unwrap();
        assert_eq!(c.camera_fps, 15);
        assert!(!c.record_on_detection);
        assert_eq!(c.http_listen.port(), 8080);
        assert_eq!(c.video_fps, 20);

        let policy = c.recording_policy();
        assert!(policy.enabled && !policy.on_detection);
    }

    #[test]
    fn test_data_subdirs() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config {
            data_dir: dir.path().join("vigil"),
            ..Config::default()
        };
        c.ensure_dirs().unwrap();
        assert!(c.recordings_dir().is_dir());
        assert!(c.faces_dir().is_dir());
        assert!(c.known_faces_dir().is_dir());
    }
}
