//! Integration tests for video streaming over the simulated camera.

mod common;

use asicam::camera::state::Mode;
use asicam::error::{ErrorClass, ServiceError};
use asicam::hardware::mock::MockFault;
use asicam::hardware::Control;
use common::{connected, service, wait_until};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_publishes_frames() {
    let (service, controller) = connected().await;

    service.stream().start().await.unwrap();
    assert_eq!(service.store().mode(), Mode::Streaming);
    assert!(controller.is_streaming());

    let slot = service.stream().slot();
    assert!(wait_until(Duration::from_secs(2), || slot.stats().frames_published >= 3).await);
    let frame = slot.latest().unwrap();
    assert!(frame.is_complete());
    assert_eq!((frame.width, frame.height), (common::WIDTH, common::HEIGHT));

    service.stream().stop().await.unwrap();
    assert_eq!(service.store().mode(), Mode::Idle);
    assert!(!controller.is_streaming());
    assert!(!service.stream().is_running().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_is_idempotent() {
    let (service, _controller) = connected().await;

    service.stream().start().await.unwrap();
    service.stream().start().await.unwrap();
    assert!(service.stream().is_running().await);
    assert_eq!(service.store().mode(), Mode::Streaming);

    service.stream().stop().await.unwrap();
    service.stream().stop().await.unwrap();
    assert_eq!(service.store().mode(), Mode::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_requires_connection() {
    let (service, _controller) = service();

    let err = service.stream().start().await.unwrap_err();
    assert!(matches!(err, ServiceError::NotConnected));
    assert_eq!(service.store().mode(), Mode::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_video_uses_auto_exposure_ceiling() {
    let (service, controller) = connected().await;
    service.stream().start().await.unwrap();

    assert_eq!(controller.control(Control::AutoMaxExposure), Some(1_000));
    assert_eq!(controller.control_auto(Control::Exposure), Some(true));

    service.stream().stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_timeouts_are_retried() {
    let (service, controller) = connected().await;
    controller.inject(MockFault::VideoTimeouts { count: 2 });

    service.stream().start().await.unwrap();
    let slot = service.stream().slot();
    assert!(wait_until(Duration::from_secs(2), || slot.latest().is_some()).await);
    assert_eq!(service.store().mode(), Mode::Streaming);
    assert!(service.store().snapshot().connected);

    service.stream().stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_stream_gives_up() {
    let (service, controller) = connected().await;
    controller.inject(MockFault::VideoTimeouts { count: 100 });

    service.stream().start().await.unwrap();
    let store = service.store().clone();
    assert!(wait_until(Duration::from_secs(3), || store.mode() == Mode::Idle).await);

    let state = store.snapshot();
    assert!(state.connected, "timeouts are not fatal");
    assert!(state.last_fault.unwrap().contains("stalled"));
    assert!(!service.stream().is_running().await);
    assert!(!controller.is_streaming());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unplug_while_streaming_disconnects() {
    let (service, controller) = connected().await;
    service.stream().start().await.unwrap();

    controller.inject(MockFault::DisconnectOnVideo);
    let store = service.store().clone();
    assert!(wait_until(Duration::from_secs(2), || !store.snapshot().connected).await);

    let state = store.snapshot();
    assert_eq!(state.mode, Mode::Idle);
    assert!(state.last_fault.is_some());
    assert!(service.stream().slot().latest().is_none());

    // Stopping after the loop died on its own still succeeds.
    service.stream().stop().await.unwrap();

    // A fatal fault needs an explicit reconnect.
    let err = service.stream().start().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::HardwareFatal);

    controller.clear_faults();
    service.connect().await.unwrap();
    service.stream().start().await.unwrap();
    assert_eq!(service.store().mode(), Mode::Streaming);
    service.stream().stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_stops_stream() {
    let (service, controller) = connected().await;
    service.stream().start().await.unwrap();

    service.disconnect().await.unwrap();
    assert!(!service.stream().is_running().await);
    assert!(!controller.is_open());
    let state = service.store().snapshot();
    assert!(!state.connected);
    assert_eq!(state.mode, Mode::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_never_serves_frame_from_previous_session() {
    let (service, _controller) = connected().await;
    service.stream().start().await.unwrap();
    let slot = service.stream().slot();
    assert!(wait_until(Duration::from_secs(2), || slot.latest().is_some()).await);
    service.stream().stop().await.unwrap();

    service
        .settings()
        .apply(asicam::camera::settings::SettingsChanges {
            gain: Some(20),
            ..Default::default()
        })
        .await
        .unwrap();
    service.stream().start().await.unwrap();

    if let Some(frame) = slot.latest() {
        assert!(frame.bytes.iter().all(|&b| b == 20));
    }
    assert!(wait_until(Duration::from_secs(2), || slot.latest().is_some()).await);
    assert!(slot.latest().unwrap().bytes.iter().all(|&b| b == 20));

    service.stream().stop().await.unwrap();
}
