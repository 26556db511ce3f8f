//! Router tests driven through `tower::ServiceExt::oneshot`.

mod common;

use asicam::http::router;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_status_reports_disconnected_camera() {
    let (service, _controller) = common::service();

    let response = router(service).oneshot(get("/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["camera"]["connected"], json!(false));
    assert_eq!(body["camera"]["mode"], json!("idle"));
    assert_eq!(body["camera"]["gain"], json!(50));
    assert_eq!(body["sequence"]["active"], json!(false));
    assert_eq!(body["alerts"][0]["kind"], json!("camera_disconnected"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_then_status() {
    let (service, _controller) = common::service();
    let app = router(service);

    let response = app
        .clone()
        .oneshot(post("/camera/connect", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let device = json_body(response).await;
    assert_eq!(device["max_width"], json!(common::WIDTH));

    let body = json_body(app.oneshot(get("/status")).await.unwrap()).await;
    assert_eq!(body["camera"]["connected"], json!(true));
    assert_eq!(body["camera"]["width"], json!(common::WIDTH));
    assert!(body["alerts"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_settings_are_400() {
    let (service, _controller) = common::connected().await;

    let response = router(service.clone())
        .oneshot(post("/camera/settings", json!({ "gain": 150 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["kind"], json!("validation"));
    assert!(body["error"].as_str().unwrap().contains("gain"));
    assert_eq!(service.store().settings().gain, 50);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_body_is_400() {
    let (service, _controller) = common::connected().await;

    let request = Request::builder()
        .method("POST")
        .uri("/camera/settings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{ not json"))
        .unwrap();
    let response = router(service).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["kind"], json!("validation"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_settings_applied() {
    let (service, _controller) = common::connected().await;

    let response = router(service)
        .oneshot(post("/camera/settings", json!({ "gain": 70, "image_format": "RAW8" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["settings"]["gain"], json!(70));
    assert_eq!(body["settings"]["image_format"], json!("RAW8"));
    assert_eq!(body["applied_to_hardware"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_returns_jpeg() {
    let (service, _controller) = common::connected().await;

    let response = router(service).oneshot(get("/camera/snapshot")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_snapshot_without_camera_is_503() {
    let (service, _controller) = common::service();

    let response = router(service).oneshot(get("/camera/snapshot")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"], json!("camera not connected"));
    assert_eq!(body["kind"], json!("hardware_fatal"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mjpeg_requires_running_stream() {
    let (service, _controller) = common::connected().await;

    let response = router(service).oneshot(get("/camera/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mjpeg_stream_emits_parts() {
    let (service, _controller) = common::connected().await;
    let app = router(service.clone());

    let response = app
        .clone()
        .oneshot(post("/camera/stream/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["mode"], json!("streaming"));

    let response = app.clone().oneshot(get("/camera/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/x-mixed-replace; boundary=frame"
    );

    let mut parts = response.into_body().into_data_stream();
    let first = tokio::time::timeout(std::time::Duration::from_secs(2), parts.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));

    let response = app
        .oneshot(post("/camera/stream/stop", json!({})))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["mode"], json!("idle"));

    // The body ends once the stream is stopped.
    let end = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while parts.next().await.is_some() {}
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_lifecycle() {
    let (service, _controller) = common::connected().await;
    let app = router(service.clone());
    let dir = TempDir::new().unwrap();

    let response = app
        .clone()
        .oneshot(post(
            "/camera/sequence/start",
            json!({
                "save_path": dir.path().display().to_string(),
                "count": 2,
                "file_format": "png",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await["total_count"], json!(2));

    service.sequence().join().await;

    let body = json_body(app.oneshot(get("/camera/sequence/status")).await.unwrap()).await;
    assert_eq!(body["active"], json!(false));
    assert_eq!(body["current_count"], json!(2));
    assert_eq!(body["stop_reason"], json!("completed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_start_during_sequence_is_409() {
    let (service, _controller) = common::connected().await;
    let app = router(service.clone());
    let dir = TempDir::new().unwrap();

    let response = app
        .clone()
        .oneshot(post(
            "/camera/sequence/start",
            json!({
                "save_path": dir.path().display().to_string(),
                "count": 3,
                "file_format": "png",
                "interval": 0.5,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(post("/camera/stream/start", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["kind"], json!("state_conflict"));

    service.sequence().stop().unwrap();
    service.sequence().join().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_bad_count_is_400() {
    let (service, _controller) = common::connected().await;

    let response = router(service)
        .oneshot(post(
            "/camera/sequence/start",
            json!({ "save_path": "/tmp/unused", "count": 0, "file_format": "png" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequence_stop_without_job() {
    let (service, _controller) = common::connected().await;

    let response = router(service)
        .oneshot(post("/camera/sequence/stop", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["active"], json!(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_capture_is_multipart() {
    let (service, _controller) = common::connected().await;

    let response = router(service)
        .oneshot(post("/camera/sequence/capture", json!({ "count": 2 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "multipart/mixed; boundary=capture"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert_eq!(text.matches("Content-Type: image/jpeg").count(), 2);
    assert!(text.contains(r#""captured":2"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cors_headers_present() {
    let (service, _controller) = common::service();

    let request = Request::builder()
        .uri("/status")
        .header(header::ORIGIN, "http://gui.local")
        .body(Body::empty())
        .unwrap();
    let response = router(service).oneshot(request).await.unwrap();
    assert!(response
        .headers()
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}
