//! Request handlers.

use crate::camera::sequence::{BatchCapture, SequenceJob, SequenceRequest};
use crate::camera::settings::{AppliedSettings, SettingsChanges};
use crate::camera::state::CameraState;
use crate::camera::{CameraService, ServiceStatus};
use crate::data::encoding::encode_jpeg;
use crate::error::ServiceError;
use crate::hardware::DeviceInfo;
use crate::http::error::{bad_body, ApiError};
use crate::http::mjpeg;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

type ApiResult<T> = Result<T, ApiError>;
type Service = State<Arc<CameraService>>;

/// Multipart boundary of `/camera/sequence/capture` responses.
pub const BATCH_BOUNDARY: &str = "capture";

/// `GET /status`
pub async fn status(State(service): Service) -> Json<ServiceStatus> {
    Json(service.status())
}

/// `POST /camera/connect`
pub async fn connect(State(service): Service) -> ApiResult<Json<DeviceInfo>> {
    Ok(Json(service.connect().await?))
}

/// `POST /camera/disconnect`
pub async fn disconnect(State(service): Service) -> ApiResult<Json<CameraState>> {
    service.disconnect().await?;
    Ok(Json(service.store().snapshot()))
}

/// `POST /camera/stream/start`
pub async fn stream_start(State(service): Service) -> ApiResult<Json<CameraState>> {
    service.stream().start().await?;
    Ok(Json(service.store().snapshot()))
}

/// `POST /camera/stream/stop`
pub async fn stream_stop(State(service): Service) -> ApiResult<Json<CameraState>> {
    service.stream().stop().await?;
    Ok(Json(service.store().snapshot()))
}

/// Long-lived MJPEG preview.
pub async fn stream(State(service): Service) -> ApiResult<Response> {
    if !service.stream().is_running().await {
        return Err(ServiceError::StreamNotRunning.into());
    }
    tracing::debug!("MJPEG client attached");
    let headers = [
        (header::CONTENT_TYPE, mjpeg::content_type()),
        (header::CACHE_CONTROL, "no-cache".to_string()),
    ];
    Ok((headers, mjpeg::mjpeg_body(service)).into_response())
}

/// `GET /camera/snapshot`, JPEG bytes.
pub async fn snapshot(State(service): Service) -> ApiResult<Response> {
    let jpeg = service.snapshot_jpeg().await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

/// `POST /camera/settings`
pub async fn apply_settings(
    State(service): Service,
    body: Result<Json<SettingsChanges>, JsonRejection>,
) -> ApiResult<Json<AppliedSettings>> {
    let Json(changes) = body.map_err(bad_body)?;
    Ok(Json(service.settings().apply(changes).await?))
}

/// `POST /camera/sequence/start`, 202 with the new job.
pub async fn sequence_start(
    State(service): Service,
    body: Result<Json<SequenceRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SequenceJob>)> {
    let Json(request) = body.map_err(bad_body)?;
    let job = service.sequence().start(request)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// `POST /camera/sequence/stop`
pub async fn sequence_stop(State(service): Service) -> ApiResult<Json<SequenceJob>> {
    Ok(Json(service.sequence().stop()?))
}

/// `GET /camera/sequence/status`
pub async fn sequence_status(State(service): Service) -> Json<SequenceJob> {
    Json(service.sequence().status())
}

/// Body of `POST /camera/sequence/capture`.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    /// Photos to take
    pub count: i64,
    /// Seconds between photos
    #[serde(default)]
    pub interval: f64,
}

/// Synchronous batch: one `image/jpeg` part per photo, then a JSON summary part.
pub async fn sequence_capture(
    State(service): Service,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(bad_body)?;
    let batch = service
        .sequence()
        .capture_batch(request.count, request.interval)
        .await?;
    let quality = service.snapshot_config().jpeg_quality;
    let body = tokio::task::spawn_blocking(move || batch_body(&batch, quality))
        .await
        .map_err(ServiceError::from)??;

    let content_type = format!("multipart/mixed; boundary={BATCH_BOUNDARY}");
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

fn batch_body(batch: &BatchCapture, quality: u8) -> Result<Vec<u8>, ServiceError> {
    let mut body = Vec::new();
    for frame in &batch.frames {
        let jpeg = encode_jpeg(frame, quality)?;
        body.extend_from_slice(format!("--{BATCH_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n");
        body.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
        body.extend_from_slice(&jpeg);
        body.extend_from_slice(b"\r\n");
    }
    let summary = json!({
        "captured": batch.frames.len(),
        "failures": batch.failures,
    })
    .to_string();
    body.extend_from_slice(format!("--{BATCH_BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    body.extend_from_slice(summary.as_bytes());
    body.extend_from_slice(format!("\r\n--{BATCH_BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}
