//! Capture supervisor and control operations shared by D-Bus and HTTP.
//!
//! At most one capture worker runs at a time. It lives on a dedicated OS
//! thread and is driven through [`Command`]s; replies come back on oneshot
//! channels.

use crate::config::Config;
use crate::live::{LiveState, LiveStatus};
use crate::outcome::Outcome;
use crate::overlay::Overlay;
use crate::pipeline::{run_capture, Command, Pipeline, PipelineSettings, RunExit};
use crate::registry::{Registry, RegistryError, SharedAnalyzer};
use crate::store::{
    self, AlertRow, DailyReport, DetectionRow, LogRow, PersonRow, Statistics, Store, StoreError,
};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use vigil_hw::{SinkOpener, SourceOpener};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub live: LiveStatus,
    pub known_persons: usize,
    pub camera: String,
}

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    thread: JoinHandle<RunExit>,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }
}

pub struct Service {
    config: Config,
    store: Arc<Store>,
    registry: Arc<Registry>,
    analyzer: SharedAnalyzer,
    live: Arc<LiveState>,
    sources: Arc<dyn SourceOpener>,
    sinks: Arc<dyn SinkOpener>,
    worker: Mutex<Option<Worker>>,
}

impl Service {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        registry: Arc<Registry>,
        analyzer: SharedAnalyzer,
        sources: Arc<dyn SourceOpener>,
        sinks: Arc<dyn SinkOpener>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            analyzer,
            live: Arc::new(LiveState::new()),
            sources,
            sinks,
            worker: Mutex::new(None),
        }
    }

    pub fn live(&self) -> &Arc<LiveState> {
        &self.live
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn start_capture(&self) -> Outcome {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(Worker::is_running) {
            return Outcome::fail("camera already running");
        }
        if let Some(finished) = worker.take() {
            join_worker(finished).await;
        }

        let pipeline = Pipeline::new(
            PipelineSettings::from_config(&self.config),
            Arc::clone(&self.analyzer),
            self.registry.gallery(),
            Arc::clone(&self.sinks),
            Overlay::load(self.config.overlay_font.as_deref()),
            Arc::clone(&self.store),
            Arc::clone(&self.live),
        );
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let sources = Arc::clone(&self.sources);
        let live = Arc::clone(&self.live);

        let spawned = std::thread::Builder::new()
            .name("vigil-capture".into())
            .spawn(move || {
                let source = match sources.open() {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return RunExit::SourceFault(e.to_string());
                    }
                };
                live.begin_capture();
                let _ = ready_tx.send(Ok(()));
                run_capture(pipeline, source, rx)
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => return Outcome::fail(format!("failed to spawn capture thread: {e}")),
        };

        let camera = self.sources.describe();
        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::info!(camera = %camera, "capture started");
                *worker = Some(Worker { commands, thread });
                Outcome::ok("camera started").with_detail(camera)
            }
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
                tracing::error!(camera = %camera, error = %e, "camera could not be opened");
                self.log_event("ERROR", "Camera could not be opened", Some(&e));
                Outcome::fail(format!("failed to open camera: {e}"))
            }
            Err(_) => Outcome::fail("capture thread exited during startup"),
        }
    }

    pub async fn stop_capture(&self) -> Outcome {
        let mut worker = self.worker.lock().await;
        let Some(current) = worker.take() else {
            return Outcome::fail("camera not running");
        };
        let was_running = current.is_running();
        let _ = current.commands.send(Command::Stop);
        let exit = join_worker(current).await;

        if !was_running {
            return Outcome::fail("camera not running");
        }
        match exit {
            Some(RunExit::SourceFault(e)) => Outcome::ok("camera stopped").with_detail(e),
            _ => Outcome::ok("camera stopped"),
        }
    }

    pub async fn start_recording(&self) -> Outcome {
        match self.send(|reply| Command::StartRecording { reply }).await {
            Some(outcome) => outcome,
            None => Outcome::fail("camera not running"),
        }
    }

    pub async fn stop_recording(&self) -> Outcome {
        match self.send(|reply| Command::StopRecording { reply }).await {
            Some(outcome) => outcome,
            None => Outcome::ok("not recording"),
        }
    }

    /// Deliver a command to the running worker. None when there is none or
    /// it exited before replying.
    async fn send(&self, command: impl FnOnce(oneshot::Sender<Outcome>) -> Command) -> Option<Outcome> {
        let (reply, rx) = oneshot::channel();
        {
            let worker = self.worker.lock().await;
            let current = worker.as_ref().filter(|w| w.is_running())?;
            current.commands.send(command(reply)).ok()?;
        }
        rx.await.ok()
    }

    /// Save the latest annotated frame as `snapshot_<stamp>.jpg` in the data dir.
    pub async fn snapshot(&self) -> Outcome {
        let Some(frame) = self.live.latest_frame() else {
            return Outcome::fail("no frame available");
        };
        let path = self
            .config
            .data_dir
            .join(format!("snapshot_{}.jpg", Local::now().format("%Y%m%d_%H%M%S")));
        let quality = self.config.jpeg_quality;

        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let bytes = vigil_hw::frame::encode_jpeg(&frame, quality).map_err(|e| e.to_string())?;
            std::fs::write(&target, bytes).map_err(|e| e.to_string())
        })
        .await;

        match written {
            Ok(Ok(())) => {
                tracing::info!(path = %path.display(), "snapshot saved");
                Outcome::ok("snapshot saved").with_detail(path.to_string_lossy())
            }
            Ok(Err(e)) => Outcome::fail(format!("failed to save snapshot: {e}")),
            Err(e) => Outcome::fail(format!("failed to save snapshot: {e}")),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            live: self.live.status(),
            known_persons: self.registry.len(),
            camera: self.sources.describe(),
        }
    }

    pub async fn add_known_person(&self, name: &str, image_path: PathBuf) -> Outcome {
        let registry = Arc::clone(&self.registry);
        let owned = name.to_string();
        let result = tokio::task::spawn_blocking(move || registry.register(&owned, &image_path)).await;
        match result {
            Ok(Ok(person)) => {
                self.log_event("INFO", &format!("Known person added: {}", person.name), None);
                let outcome = Outcome::ok(format!("added {}", person.name));
                match person.image_path {
                    Some(path) => outcome.with_detail(path.to_string_lossy()),
                    None => outcome,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(name, error = %e, "registration rejected");
                Outcome::fail(e.to_string())
            }
            Err(e) => Outcome::fail(format!("registration failed: {e}")),
        }
    }

    /// Register from uploaded image bytes. The upload is staged in the data
    /// directory and removed once the registry has copied it.
    pub async fn add_known_person_image(&self, name: &str, bytes: Vec<u8>) -> Outcome {
        let ext = match image::guess_format(&bytes) {
            Ok(image::ImageFormat::Jpeg) => "jpg",
            Ok(image::ImageFormat::Png) => "png",
            _ => return Outcome::fail("image must be JPEG or PNG"),
        };
        let staged = tempfile::Builder::new()
            .prefix("upload_")
            .suffix(&format!(".{ext}"))
            .tempfile_in(&self.config.data_dir)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                Ok(file.into_temp_path())
            });
        let staged = match staged {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(name, error = %e, "could not stage uploaded image");
                return Outcome::fail(format!("cannot store upload: {e}"));
            }
        };
        self.add_known_person(name, staged.to_path_buf()).await
    }

    pub async fn remove_known_person(&self, name: &str) -> Outcome {
        let registry = Arc::clone(&self.registry);
        let owned = name.to_string();
        let result = tokio::task::spawn_blocking(move || registry.remove(&owned)).await;
        match result {
            Ok(Ok(person)) => {
                self.log_event("INFO", &format!("Known person removed: {}", person.name), None);
                Outcome::ok(format!("removed {}", person.name))
            }
            Ok(Err(e)) => Outcome::fail(e.to_string()),
            Err(e) => Outcome::fail(format!("removal failed: {e}")),
        }
    }

    pub async fn list_known_persons(&self) -> Result<Vec<PersonRow>, ServiceError> {
        self.query(|store| store.list_known_persons()).await
    }

    pub async fn recent_detections(&self, limit: u32) -> Result<Vec<DetectionRow>, ServiceError> {
        self.query(move |store| store.recent_detections(limit)).await
    }

    pub async fn detections_by_person(&self, name: &str) -> Result<Vec<DetectionRow>, ServiceError> {
        let name = name.to_string();
        self.query(move |store| store.detections_by_person(&name)).await
    }

    pub async fn intruder_detections(&self, limit: u32) -> Result<Vec<DetectionRow>, ServiceError> {
        self.query(move |store| store.intruder_detections(limit)).await
    }

    pub async fn alerts(&self) -> Result<Vec<AlertRow>, ServiceError> {
        self.query(|store| store.unacknowledged_alerts()).await
    }

    pub async fn acknowledge_alert(&self, id: i64) -> Outcome {
        match self.query(move |store| store.acknowledge_alert(id)).await {
            Ok(true) => Outcome::ok("alert acknowledged"),
            Ok(false) => Outcome::fail(format!("alert {id} not found")),
            Err(e) => Outcome::fail(e.to_string()),
        }
    }

    pub async fn statistics(&self) -> Result<Statistics, ServiceError> {
        self.query(|store| store.statistics()).await
    }

    /// Report for `date`, or today.
    pub async fn daily_report(&self, date: Option<NaiveDate>) -> Result<DailyReport, ServiceError> {
        let date = date.unwrap_or_else(|| Local::now().date_naive());
        self.query(move |store| store.daily_report(date)).await
    }

    pub async fn recent_logs(&self, limit: u32) -> Result<Vec<LogRow>, ServiceError> {
        self.query(move |store| store.recent_logs(limit)).await
    }

    async fn query<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    fn log_event(&self, level: &str, message: &str, details: Option<&str>) {
        store::log_failure("log system event", self.store.log_system_event(level, message, details));
    }

    /// Stop the worker, closing any open recording.
    pub async fn shutdown(&self) {
        let outcome = self.stop_capture().await;
        tracing::info!(message = %outcome.message, "service shut down");
    }
}

async fn join_worker(worker: Worker) -> Option<RunExit> {
    match tokio::task::spawn_blocking(move || worker.thread.join()).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(_)) => {
            tracing::error!("capture thread panicked");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "could not join capture thread");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::recorder::tests::MemoryOpener;
    use crate::registry::share_analyzer;
    use crate::registry::tests::{marker_image, MarkerAnalyzer};
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;
    use vigil_hw::{CameraError, Frame, FrameSource};

    /// Endless source of black frames that can be told to fail.
    struct FakeSource {
        seq: u32,
        fail: Arc<AtomicBool>,
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CameraError::CaptureFailed("cable pulled".into()));
            }
            std::thread::sleep(Duration::from_millis(2));
            self.seq += 1;
            Ok(Some(Frame::new(RgbImage::new(64, 48), self.seq)))
        }

        fn release(&mut self) {}
    }

    #[derive(Default)]
    struct FakeOpener {
        refuse: AtomicBool,
        fail_reads: Arc<AtomicBool>,
        opened: AtomicU32,
    }

    impl SourceOpener for FakeOpener {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSource {
                seq: 0,
                fail: Arc::clone(&self.fail_reads),
            }))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    pub(crate) struct Fixture {
        pub _dir: tempfile::TempDir,
        pub data: PathBuf,
        pub service: Service,
        pub store: Arc<Store>,
        sources: Arc<FakeOpener>,
        sinks: Arc<MemoryOpener>,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            ..Config::default()
        };
        config.ensure_dirs().unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let analyzer = share_analyzer(Box::new(MarkerAnalyzer));
        let registry = Arc::new(Registry::new(
            Arc::clone(&store),
            Arc::clone(&analyzer),
            config.known_faces_dir(),
            config.face_size_threshold as f32,
        ));
        let sources = Arc::new(FakeOpener::default());
        let sinks = Arc::new(MemoryOpener::default());
        let data = config.data_dir.clone();
        let service = Service::new(
            config,
            Arc::clone(&store),
            registry,
            analyzer,
            sources.clone(),
            sinks.clone(),
        );
        Fixture {
            _dir: dir,
            data,
            service,
            store,
            sources,
            sinks,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_capture_start_stop() {
        let f = fixture();
        assert_eq!(f.service.stop_capture().await.message, "camera not running");

        let started = f.service.start_capture().await;
        assert!(started.success, "{started:?}");
        assert!(f.service.status().live.is_running);

        let again = f.service.start_capture().await;
        assert!(!again.success);
        assert_eq!(again.message, "camera already running");
        assert_eq!(f.sources.opened.load(Ordering::SeqCst), 1);

        assert!(f.service.stop_capture().await.success);
        assert!(!f.service.status().live.is_running);
        assert!(!f.service.stop_capture().await.success);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let f = fixture();
        f.sources.refuse.store(true, Ordering::SeqCst);
        let outcome = f.service.start_capture().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("failed to open camera"));
        assert!(!f.service.live().is_capturing());

        f.sources.refuse.store(false, Ordering::SeqCst);
        assert!(f.service.start_capture().await.success);
        f.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_recording_requires_capture() {
        let f = fixture();
        let start = f.service.start_recording().await;
        assert!(!start.success);
        assert_eq!(start.message, "camera not running");
        let stop = f.service.stop_recording().await;
        assert!(stop.success);
        assert_eq!(stop.message, "not recording");
    }

    #[tokio::test]
    async fn test_manual_recording_through_worker() {
        let f = fixture();
        f.service.start_capture().await;
        let live = Arc::clone(f.service.live());
        wait_until(|| live.latest_frame().is_some()).await;

        let start = f.service.start_recording().await;
        assert!(start.success, "{start:?}");
        assert!(live.is_recording());
        assert_eq!(f.service.start_recording().await.message, "already recording");

        let stop = f.service.stop_recording().await;
        assert_eq!(stop.message, "recording stopped");
        assert!(!live.is_recording());

        // Stopping capture while recording closes the file first
        f.service.start_recording().await;
        f.service.stop_capture().await;
        let log = f.sinks.log.lock().unwrap();
        assert_eq!(log.opened.len(), 2);
        assert_eq!(log.closed.len(), 2);
    }

    #[tokio::test]
    async fn test_source_fault_ends_run() {
        let f = fixture();
        f.service.start_capture().await;
        f.sources.fail_reads.store(true, Ordering::SeqCst);
        let live = Arc::clone(f.service.live());
        wait_until(|| !live.is_capturing()).await;

        let status = f.service.status();
        assert!(!status.live.is_running);
        assert!(status.live.last_error.unwrap().contains("cable pulled"));

        // A new run can start after the fault
        f.sources.fail_reads.store(false, Ordering::SeqCst);
        assert!(f.service.start_capture().await.success);
        f.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot() {
        let f = fixture();
        let none = f.service.snapshot().await;
        assert!(!none.success);
        assert_eq!(none.message, "no frame available");

        f.service.start_capture().await;
        let live = Arc::clone(f.service.live());
        wait_until(|| live.latest_frame().is_some()).await;
        let saved = f.service.snapshot().await;
        assert!(saved.success, "{saved:?}");
        let path = PathBuf::from(saved.detail.unwrap());
        assert!(path.starts_with(&f.data));
        assert!(path.exists());
        f.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_known_person_lifecycle() {
        let f = fixture();
        let src = f.data.join("bob.png");
        marker_image(&[40]).save(&src).unwrap();

        let added = f.service.add_known_person("bob", src.clone()).await;
        assert!(added.success, "{added:?}");
        assert_eq!(f.service.status().known_persons, 1);
        assert!(!f.service.add_known_person("bob", src).await.success);

        let listed = f.service.list_known_persons().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "bob");
        let logs = f.service.recent_logs(5).await.unwrap();
        assert_eq!(logs[0].message, "Known person added: bob");

        assert!(f.service.remove_known_person("bob").await.success);
        assert!(!f.service.remove_known_person("bob").await.success);
        assert_eq!(f.service.status().known_persons, 0);
    }

    #[tokio::test]
    async fn test_add_known_person_from_upload() {
        let f = fixture();
        let mut png = std::io::Cursor::new(Vec::new());
        marker_image(&[40])
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();

        let added = f.service.add_known_person_image("carol", png.into_inner()).await;
        assert!(added.success, "{added:?}");
        assert_eq!(f.service.status().known_persons, 1);
        // Only the copy in known_faces remains; the staged upload is gone
        let leftovers: Vec<_> = std::fs::read_dir(&f.data)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("upload_"))
            .collect();
        assert!(leftovers.is_empty());

        let rejected = f.service.add_known_person_image("dave", b"GIF89a".to_vec()).await;
        assert!(!rejected.success);
        assert_eq!(rejected.message, "image must be JPEG or PNG");
    }

    #[tokio::test]
    async fn test_alert_acknowledgement() {
        let f = fixture();
        let id = f
            .service
            .store
            .create_alert("UNKNOWN_PERSON", &vigil_core::IdentityLabel::Unrecognized, "test")
            .unwrap();
        assert_eq!(f.service.alerts().await.unwrap().len(), 1);
        assert!(f.service.acknowledge_alert(id).await.success);
        assert!(f.service.alerts().await.unwrap().is_empty());
        assert!(!f.service.acknowledge_alert(id + 100).await.success);

        let stats = f.service.statistics().await.unwrap();
        assert_eq!(stats.pending_alerts, 0);
        let report = f.service.daily_report(None).await.unwrap();
        assert!(report.known.is_empty());
        assert_eq!(report.alerts, 1);
    }
}
