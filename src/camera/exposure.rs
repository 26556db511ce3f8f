//! Single-exposure protocol.
//!
//! Shared by snapshots, sequence jobs and batch capture. The whole protocol runs on the
//! blocking pool; the gate is taken per hardware call so status queries and the
//! sequence stop request stay responsive while the sensor integrates.
//!
//! 1. leftover exposure check: wait up to `stuck_wait_ms`, then abort and settle
//! 2. write format, manual exposure, gain and image controls
//! 3. start, then poll every `poll_interval_ms` until success, failure or the deadline
//!    (`exposure + grace_ms`); a missed deadline aborts the exposure
//! 4. fetch the frame

use crate::camera::settings::write_image_controls;
use crate::camera::state::{CameraSettings, CameraStateStore, Mode};
use crate::config::ExposureConfig;
use crate::error::{HwError, ServiceResult};
use crate::hardware::{Control, ExposureStatus, Frame};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs deadline-bounded single exposures.
#[derive(Clone)]
pub struct ExposureRunner {
    store: Arc<CameraStateStore>,
    config: ExposureConfig,
}

impl ExposureRunner {
    /// Runner using `config` timings.
    pub fn new(store: Arc<CameraStateStore>, config: ExposureConfig) -> Self {
        Self { store, config }
    }

    /// Capture one frame with the stored photo settings.
    ///
    /// The caller must have stopped streaming. The mode is `Exposing` for the duration
    /// and back at `Idle` when this returns, whatever the outcome.
    ///
    /// # Errors
    /// - [`ServiceError::NotConnected`](crate::error::ServiceError::NotConnected)
    /// - [`ServiceError::State`](crate::error::ServiceError::State) if streaming or already exposing
    /// - [`HwError::ExposureTimeout`] / [`HwError::ExposureFailed`] and any hardware error;
    ///   fatal ones mark the camera disconnected
    pub async fn expose(&self) -> ServiceResult<Frame> {
        self.store.enter(Mode::Exposing)?;

        let state = self.store.snapshot();
        let (width, height) = (state.width, state.height);
        let settings = state.settings;
        let store = Arc::clone(&self.store);
        let config = self.config.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_exposure(&store, &config, &settings, width, height)
        })
        .await;

        self.store.leave(Mode::Exposing);
        match outcome {
            Ok(Ok(frame)) => {
                self.store.clear_fault();
                Ok(frame)
            }
            Ok(Err(e)) => {
                self.store.record_hw_error(&e);
                Err(e.into())
            }
            Err(join) => {
                let err = join.into();
                self.store.record_service_error(&err);
                Err(err)
            }
        }
    }
}

fn run_exposure(
    store: &CameraStateStore,
    config: &ExposureConfig,
    settings: &CameraSettings,
    width: u32,
    height: u32,
) -> Result<Frame, HwError> {
    recover_stuck_exposure(store, config)?;

    let exposure_us = i64::try_from(settings.photo_exposure_us).unwrap_or(i64::MAX);
    store.with_hardware(|hw| {
        hw.configure_format(settings.image_format, width, height)?;
        hw.set_control(Control::Exposure, exposure_us, false)?;
        write_image_controls(hw, settings)?;
        hw.start_exposure()
    })?;

    let deadline = config.deadline(settings.photo_exposure_us);
    let poll = config.poll_interval();
    let started = Instant::now();
    tracing::debug!(
        exposure_us = settings.photo_exposure_us,
        gain = settings.gain,
        format = %settings.image_format,
        deadline_ms = deadline.as_millis() as u64,
        "Exposure started"
    );

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        std::thread::sleep(poll.min(remaining.max(Duration::from_millis(1))));

        match store.with_hardware(|hw| hw.poll_exposure_status())? {
            ExposureStatus::Success => break,
            ExposureStatus::Failed => {
                tracing::warn!("Camera reported a failed exposure");
                return Err(HwError::ExposureFailed);
            }
            ExposureStatus::InProgress | ExposureStatus::Idle => {}
        }

        if started.elapsed() >= deadline {
            let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(waited_ms, "Exposure missed its deadline, aborting");
            abort_and_settle(store, config);
            return Err(HwError::ExposureTimeout { waited_ms });
        }
    }

    let frame = store.with_hardware(|hw| hw.fetch_exposed_frame())?;
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        width = frame.width,
        height = frame.height,
        format = %frame.format,
        "Exposure complete"
    );
    Ok(frame)
}

/// Clear an exposure left running by an earlier request.
fn recover_stuck_exposure(store: &CameraStateStore, config: &ExposureConfig) -> Result<(), HwError> {
    if store.with_hardware(|hw| hw.poll_exposure_status())? != ExposureStatus::InProgress {
        return Ok(());
    }

    tracing::warn!(
        wait_ms = config.stuck_wait_ms,
        "Earlier exposure still in progress, waiting for it"
    );
    let wait = Duration::from_millis(config.stuck_wait_ms);
    let started = Instant::now();
    while started.elapsed() < wait {
        std::thread::sleep(config.poll_interval().min(wait));
        if store.with_hardware(|hw| hw.poll_exposure_status())? != ExposureStatus::InProgress {
            return Ok(());
        }
    }

    tracing::warn!("Exposure stuck, aborting it");
    abort_and_settle(store, config);
    Ok(())
}

fn abort_and_settle(store: &CameraStateStore, config: &ExposureConfig) {
    if let Err(e) = store.with_hardware(|hw| hw.abort_exposure()) {
        tracing::warn!(error = %e, "Aborting exposure failed");
    }
    std::thread::sleep(Duration::from_millis(config.abort_settle_ms));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::hardware::mock::{MockCamera, MockController, MockFault};
    use crate::hardware::{Control, ImageFormat};

    fn fast_config() -> ExposureConfig {
        ExposureConfig {
            poll_interval_ms: 5,
            grace_ms: 100,
            stuck_wait_ms: 30,
            abort_settle_ms: 1,
        }
    }

    fn runner() -> (ExposureRunner, Arc<CameraStateStore>, MockController) {
        let camera = MockCamera::new(64, 48);
        let ctl = camera.controller();
        let settings = CameraSettings {
            photo_exposure_us: 1_000,
            image_format: ImageFormat::Raw16,
            gain: 33,
            ..CameraSettings::default()
        };
        let store = Arc::new(CameraStateStore::new(Box::new(camera), settings));
        let info = store.with_hardware(|hw| hw.open()).unwrap();
        store.mark_connected(info);
        (ExposureRunner::new(Arc::clone(&store), fast_config()), store, ctl)
    }

    #[tokio::test]
    async fn exposes_with_photo_settings() {
        let (runner, store, ctl) = runner();
        let frame = runner.expose().await.unwrap();

        assert_eq!(frame.format, ImageFormat::Raw16);
        assert!(frame.is_complete());
        assert_eq!(ctl.control(Control::Exposure), Some(1_000));
        assert_eq!(ctl.control_auto(Control::Exposure), Some(false));
        assert_eq!(ctl.control(Control::Gain), Some(33));
        assert_eq!(store.mode(), Mode::Idle);
    }

    #[tokio::test]
    async fn failed_exposure_is_transient() {
        let (runner, store, ctl) = runner();
        ctl.inject(MockFault::FailExposure { nth: 1 });

        let err = runner.expose().await.unwrap_err();
        assert!(matches!(err, ServiceError::Hardware(HwError::ExposureFailed)));
        let state = store.snapshot();
        assert!(state.connected);
        assert_eq!(state.mode, Mode::Idle);
        assert!(state.last_fault.is_some());

        // Next one succeeds and clears the fault.
        runner.expose().await.unwrap();
        assert!(store.snapshot().last_fault.is_none());
    }

    #[tokio::test]
    async fn hung_exposure_times_out_and_is_aborted() {
        let (runner, store, ctl) = runner();
        ctl.inject(MockFault::HangExposure { nth: 1 });

        let err = runner.expose().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Hardware(HwError::ExposureTimeout { .. })
        ));
        assert_eq!(ctl.exposures_aborted(), 1);
        assert_eq!(store.mode(), Mode::Idle);
    }

    #[tokio::test]
    async fn stuck_exposure_is_recovered_before_starting() {
        let (runner, _store, ctl) = runner();
        ctl.inject(MockFault::StuckExposure);

        runner.expose().await.unwrap();
        assert_eq!(ctl.exposures_aborted(), 1);
        assert_eq!(ctl.exposures_started(), 1);
    }

    #[tokio::test]
    async fn disconnect_marks_camera_disconnected() {
        let (runner, store, ctl) = runner();
        ctl.inject(MockFault::DisconnectOnExposure { nth: 1 });

        let err = runner.expose().await.unwrap_err();
        assert!(err.is_fatal());
        let state = store.snapshot();
        assert!(!state.connected);
        assert_eq!(state.mode, Mode::Idle);

        assert!(matches!(
            runner.expose().await,
            Err(ServiceError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn refuses_while_streaming() {
        let (runner, store, _ctl) = runner();
        store.transition(Mode::Streaming).unwrap();
        assert!(matches!(
            runner.expose().await,
            Err(ServiceError::State(_))
        ));
        assert_eq!(store.mode(), Mode::Streaming);
    }
}
