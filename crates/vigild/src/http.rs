//! HTTP surface: status, latest frame, MJPEG stream and control endpoints.

use crate::live::LiveState;
use crate::outcome::Outcome;
use crate::service::{Service, ServiceStatus};
use crate::store::{AlertRow, DailyReport, DetectionRow, LogRow, PersonRow, Statistics};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{Local, NaiveDate};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

const DEFAULT_LIST_LIMIT: u32 = 50;
const DEFAULT_INTRUDER_LIMIT: u32 = 500;
const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type Result<T, E = AppError> = std::result::Result<T, E>;

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/camera/status", get(camera_status))
        .route("/api/camera/frame", get(camera_frame))
        .route("/api/camera/stream", get(camera_stream))
        .route("/api/camera/start", post(camera_start))
        .route("/api/camera/stop", post(camera_stop))
        .route("/api/camera/snapshot", post(camera_snapshot))
        .route("/api/recording/start", post(recording_start))
        .route("/api/recording/stop", post(recording_stop))
        .route("/api/persons", get(list_persons).post(add_person))
        .route("/api/persons/{name}", delete(remove_person))
        .route("/api/persons/{name}/detections", get(person_detections))
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/{id}/acknowledge", post(acknowledge_alert))
        .route("/api/detections/recent", get(recent_detections))
        .route("/api/statistics", get(statistics))
        .route("/api/reports/daily", get(daily_report))
        .route("/api/reports/intruders", get(intruder_report))
        .route("/api/logs", get(recent_logs))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Local::now().to_rfc3339(),
    }))
}

async fn camera_status(State(service): State<Arc<Service>>) -> Json<ServiceStatus> {
    Json(service.status())
}

async fn camera_frame(State(service): State<Arc<Service>>) -> Result<Response> {
    let Some(frame) = service.live().latest_frame() else {
        return Ok((StatusCode::NOT_FOUND, Json(Outcome::fail("no frame available"))).into_response());
    };
    let quality = service.config().jpeg_quality;
    let jpeg =
        tokio::task::spawn_blocking(move || vigil_hw::frame::encode_jpeg(&frame, quality)).await??;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

async fn camera_stream(State(service): State<Arc<Service>>) -> Response {
    let stream = mjpeg_stream(
        Arc::clone(service.live()),
        service.config().stream_interval(),
        service.config().jpeg_quality,
    );
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// One multipart part per new frame, sampled every `interval`. Ends when
/// capture stops.
fn mjpeg_stream(
    live: Arc<LiveState>,
    interval: Duration,
    quality: u8,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    futures::stream::unfold((live, None::<u64>), move |(live, last_seq)| async move {
        if last_seq.is_some() {
            tokio::time::sleep(interval).await;
        }
        loop {
            if !live.is_capturing() {
                return None;
            }
            if let Some((seq, frame)) = live.latest_frame_seq() {
                if Some(seq) != last_seq {
                    let encoded =
                        tokio::task::spawn_blocking(move || vigil_hw::frame::encode_jpeg(&frame, quality))
                            .await;
                    match encoded {
                        Ok(Ok(jpeg)) => return Some((Ok(mjpeg_part(&jpeg)), (live, Some(seq)))),
                        Ok(Err(e)) => tracing::debug!(error = %e, "skipping stream frame"),
                        Err(e) => tracing::debug!(error = %e, "stream encoder task failed"),
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
    })
}

async fn camera_start(State(service): State<Arc<Service>>) -> Json<Outcome> {
    Json(service.start_capture().await)
}

async fn camera_stop(State(service): State<Arc<Service>>) -> Json<Outcome> {
    Json(service.stop_capture().await)
}

async fn camera_snapshot(State(service): State<Arc<Service>>) -> Json<Outcome> {
    Json(service.snapshot().await)
}

async fn recording_start(State(service): State<Arc<Service>>) -> Json<Outcome> {
    Json(service.start_recording().await)
}

async fn recording_stop(State(service): State<Arc<Service>>) -> Json<Outcome> {
    Json(service.stop_recording().await)
}

async fn list_persons(State(service): State<Arc<Service>>) -> Result<Json<Vec<PersonRow>>> {
    Ok(Json(service.list_known_persons().await?))
}

#[derive(Debug, Deserialize)]
struct AddPersonRequest {
    name: String,
    /// Base64 JPEG or PNG, optionally as a `data:image/...;base64,` URL.
    image: String,
}

/// Accepts plain base64 or a data URL.
fn decode_image_payload(payload: &str) -> Option<Vec<u8>> {
    let encoded = match payload.strip_prefix("data:") {
        Some(url) => url.split_once(',')?.1,
        None => payload,
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}

async fn add_person(
    State(service): State<Arc<Service>>,
    Json(request): Json<AddPersonRequest>,
) -> (StatusCode, Json<Outcome>) {
    let Some(bytes) = decode_image_payload(&request.image) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(Outcome::fail("image is not valid base64")),
        );
    };
    let outcome = service.add_known_person_image(&request.name, bytes).await;
    let status = if outcome.success {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

async fn person_detections(
    State(service): State<Arc<Service>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<DetectionRow>>> {
    Ok(Json(service.detections_by_person(&name).await?))
}

async fn remove_person(
    State(service): State<Arc<Service>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Outcome>) {
    let outcome = service.remove_known_person(&name).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(outcome))
}

async fn list_alerts(State(service): State<Arc<Service>>) -> Result<Json<Vec<AlertRow>>> {
    Ok(Json(service.alerts().await?))
}

async fn acknowledge_alert(
    State(service): State<Arc<Service>>,
    Path(id): Path<i64>,
) -> Json<Outcome> {
    Json(service.acknowledge_alert(id).await)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn recent_detections(
    State(service): State<Arc<Service>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DetectionRow>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(service.recent_detections(limit).await?))
}

async fn recent_logs(
    State(service): State<Arc<Service>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LogRow>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(service.recent_logs(limit).await?))
}

async fn intruder_report(
    State(service): State<Arc<Service>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DetectionRow>>> {
    let limit = query.limit.unwrap_or(DEFAULT_INTRUDER_LIMIT);
    Ok(Json(service.intruder_detections(limit).await?))
}

async fn statistics(State(service): State<Arc<Service>>) -> Result<Json<Statistics>> {
    Ok(Json(service.statistics().await?))
}

#[derive(Debug, Deserialize)]
struct ReportQuery {
    date: Option<NaiveDate>,
}

async fn daily_report(
    State(service): State<Arc<Service>>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<DailyReport>> {
    Ok(Json(service.daily_report(query.date).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::fixture;
    use crate::store::NewDetection;
    use vigil_core::IdentityLabel;
    use futures::StreamExt;
    use image::RgbImage;

    #[test]
    fn test_mjpeg_part_framing() {
        let part = mjpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_stream_ends_when_not_capturing() {
        let live = Arc::new(LiveState::new());
        live.publish(RgbImage::new(8, 8), Vec::new(), 0.0);
        let parts: Vec<_> = mjpeg_stream(live, Duration::from_millis(1), 80).collect().await;
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn test_stream_yields_each_new_frame_once() {
        let live = Arc::new(LiveState::new());
        live.begin_capture();
        live.publish(RgbImage::new(8, 8), Vec::new(), 0.0);

        let mut stream = Box::pin(mjpeg_stream(Arc::clone(&live), Duration::from_millis(1), 80));
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"--frame"));

        live.publish(RgbImage::new(8, 8), Vec::new(), 0.0);
        assert!(stream.next().await.is_some());

        live.end_capture(None);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_frame_endpoint_without_frame() {
        let f = fixture();
        let service = Arc::new(f.service);
        let response = camera_frame(State(service)).await.unwrap_or_else(|e| e.into_response());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_frame_endpoint_serves_jpeg() {
        let f = fixture();
        let service = Arc::new(f.service);
        service.live().publish(RgbImage::new(16, 16), Vec::new(), 0.0);
        let response = camera_frame(State(service)).await.unwrap_or_else(|e| e.into_response());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    }

    fn marker_png_base64(marker: u8) -> String {
        let mut png = std::io::Cursor::new(Vec::new());
        crate::registry::tests::marker_image(&[marker])
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(png.into_inner())
    }

    #[test]
    fn test_decode_image_payload_accepts_data_url() {
        assert_eq!(decode_image_payload("aGk="), Some(b"hi".to_vec()));
        assert_eq!(
            decode_image_payload("data:image/png;base64,aGk="),
            Some(b"hi".to_vec())
        );
        assert_eq!(decode_image_payload("data:image/png;base64"), None);
        assert_eq!(decode_image_payload("not base64!"), None);
    }

    #[tokio::test]
    async fn test_add_person_from_base64_upload() {
        let f = fixture();
        let service = Arc::new(f.service);
        let request = AddPersonRequest {
            name: "erin".into(),
            image: format!("data:image/png;base64,{}", marker_png_base64(60)),
        };
        let (status, Json(outcome)) = add_person(State(Arc::clone(&service)), Json(request)).await;
        assert_eq!(status, StatusCode::CREATED, "{outcome:?}");
        let Json(persons) = list_persons(State(Arc::clone(&service)))
            .await
            .unwrap_or_else(|_| panic!("list failed"));
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].name, "erin");

        let bad = AddPersonRequest {
            name: "frank".into(),
            image: "%%%".into(),
        };
        let (status, Json(outcome)) = add_person(State(Arc::clone(&service)), Json(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!outcome.success);

        let traversal = AddPersonRequest {
            name: "../frank".into(),
            image: marker_png_base64(60),
        };
        let (status, _) = add_person(State(service), Json(traversal)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_person_detections_and_intruder_report() {
        let f = fixture();
        for label in [
            IdentityLabel::Known("gina".into()),
            IdentityLabel::Unrecognized,
            IdentityLabel::Known("hal".into()),
        ] {
            f.store
                .log_detection(&NewDetection {
                    identity: &label,
                    confidence: 0.5,
                    face_image_path: None,
                    video_path: None,
                    camera_id: "0",
                })
                .unwrap();
        }
        let service = Arc::new(f.service);

        let Json(rows) = person_detections(State(Arc::clone(&service)), Path("gina".into()))
            .await
            .unwrap_or_else(|_| panic!("query failed"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].person_name.as_deref(), Some("gina"));

        let Json(rows) = intruder_report(State(service), Query(LimitQuery { limit: None }))
            .await
            .unwrap_or_else(|_| panic!("query failed"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].person_id.as_deref(), Some("unknown"));
    }

    #[tokio::test]
    async fn test_remove_unknown_person_is_404() {
        let f = fixture();
        let (status, Json(outcome)) =
            remove_person(State(Arc::new(f.service)), Path("nobody".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!outcome.success);
    }
}
