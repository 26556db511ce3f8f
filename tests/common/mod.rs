//! Shared harness: a service over the simulated camera with short timings.

#![allow(dead_code)]

use asicam::camera::CameraService;
use asicam::config::{Backend, ExposureConfig, ServiceConfig};
use asicam::hardware::mock::{MockCamera, MockController};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// Configuration with millisecond-scale timeouts.
pub fn fast_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.camera.backend = Backend::Mock;
    config.camera.photo_exposure_us = 1_000;
    config.camera.video_exposure_us = 1_000;
    config.stream.poll_timeout_ms = 50;
    config.stream.max_poll_timeout_ms = 100;
    config.stream.max_consecutive_timeouts = 3;
    config.stream.mjpeg_interval_ms = 10;
    config.exposure = ExposureConfig {
        poll_interval_ms: 2,
        grace_ms: 200,
        stuck_wait_ms: 30,
        abort_settle_ms: 1,
    };
    config.snapshot.settle_ms = 1;
    config
}

/// Service and controller, not yet connected.
pub fn service() -> (Arc<CameraService>, MockController) {
    let camera = MockCamera::new(WIDTH, HEIGHT)
        .with_frame_interval(Duration::from_millis(5))
        .with_exposure_duration(Duration::from_millis(5));
    let controller = camera.controller();
    let service = Arc::new(CameraService::new(Box::new(camera), &fast_config()));
    (service, controller)
}

/// Service with the camera open.
pub async fn connected() -> (Arc<CameraService>, MockController) {
    let (service, controller) = service();
    service.connect().await.unwrap();
    (service, controller)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
