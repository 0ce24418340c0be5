use crate::service::{Service, ServiceError};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.vigil.Watch1";
pub const OBJECT_PATH: &str = "/org/vigil/Watch1";

/// D-Bus interface for the Vigil daemon.
///
/// Bus name: org.vigil.Watch1
/// Object path: /org/vigil/Watch1
///
/// Control methods return a JSON `{success, message, detail?}` object; query
/// methods return the JSON rows and fail with `org.freedesktop.DBus.Error.Failed`.
pub struct WatchService {
    service: Arc<Service>,
}

impl WatchService {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

fn to_json<T: Serialize>(result: Result<T, ServiceError>) -> zbus::fdo::Result<String> {
    let value = result.map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    serde_json::to_string(&value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.vigil.Watch1")]
impl WatchService {
    async fn start_capture(&self) -> String {
        tracing::info!("start_capture requested");
        self.service.start_capture().await.to_json()
    }

    async fn stop_capture(&self) -> String {
        tracing::info!("stop_capture requested");
        self.service.stop_capture().await.to_json()
    }

    async fn start_recording(&self) -> String {
        tracing::info!("start_recording requested");
        self.service.start_recording().await.to_json()
    }

    async fn stop_recording(&self) -> String {
        tracing::info!("stop_recording requested");
        self.service.stop_recording().await.to_json()
    }

    async fn snapshot(&self) -> String {
        self.service.snapshot().await.to_json()
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.service.status();
        serde_json::to_string(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
        }))
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Register a known person from a single-face image on the daemon's filesystem.
    async fn add_known_person(&self, name: &str, image_path: &str) -> String {
        tracing::info!(name, image_path, "add_known_person requested");
        self.service
            .add_known_person(name, PathBuf::from(image_path))
            .await
            .to_json()
    }

    async fn remove_known_person(&self, name: &str) -> String {
        tracing::info!(name, "remove_known_person requested");
        self.service.remove_known_person(name).await.to_json()
    }

    async fn list_known_persons(&self) -> zbus::fdo::Result<String> {
        to_json(self.service.list_known_persons().await)
    }

    async fn recent_detections(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(self.service.recent_detections(limit).await)
    }

    /// Unacknowledged alerts, newest first.
    async fn alerts(&self) -> zbus::fdo::Result<String> {
        to_json(self.service.alerts().await)
    }

    async fn acknowledge_alert(&self, id: i64) -> String {
        self.service.acknowledge_alert(id).await.to_json()
    }

    async fn statistics(&self) -> zbus::fdo::Result<String> {
        to_json(self.service.statistics().await)
    }

    async fn recent_logs(&self, limit: u32) -> zbus::fdo::Result<String> {
        to_json(self.service.recent_logs(limit).await)
    }

    /// `date` is `YYYY-MM-DD`; empty means today.
    async fn daily_report(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = if date.is_empty() {
            None
        } else {
            let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("bad date '{date}': {e}"))
            })?;
            Some(parsed)
        };
        to_json(self.service.daily_report(date).await)
    }
}
