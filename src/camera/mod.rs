//! Camera Control
//!
//! [`CameraService`] wires the pieces together and adds the operations that span
//! several of them:
//!
//! - [`state`]: [`CameraStateStore`](state::CameraStateStore), the gate and the mode machine
//! - [`stream`]: [`StreamEngine`](stream::StreamEngine) and the single-slot frame buffer
//! - [`exposure`]: deadline-bounded single exposures
//! - [`sequence`]: background sequence jobs and synchronous batches
//! - [`settings`]: validation and application of settings changes
//!
//! ```rust,ignore
//! let service = CameraService::from_config(&config);
//! service.connect().await?;
//! service.stream().start().await?;
//! let jpeg = service.snapshot_jpeg().await?;   // pauses and resumes the stream
//! ```

pub mod exposure;
pub mod sequence;
pub mod settings;
pub mod state;
pub mod stream;

use crate::camera::exposure::ExposureRunner;
use crate::camera::sequence::{SequenceController, SequenceJob};
use crate::camera::settings::{write_image_controls, SettingsApplier};
use crate::camera::state::{CameraSettings, CameraState, CameraStateStore};
use crate::camera::stream::{StreamEngine, StreamStats};
use crate::config::{Backend, ServiceConfig, SnapshotConfig, StreamConfig};
use crate::data::encoding::encode_jpeg;
use crate::error::{HwError, ServiceError, ServiceResult};
use crate::hardware::asi::AsiCamera;
use crate::hardware::mock::MockCamera;
use crate::hardware::{Control, DeviceInfo, Frame, HardwareHandle, ImageFormat};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Kind of a `/status` alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// No open camera
    CameraDisconnected,
    /// A hardware fault is recorded
    HardwareFault,
    /// The current or last sequence skipped photos
    SequenceFailures,
}

/// Condition worth showing to an operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Alert kind
    pub kind: AlertKind,
    /// Human readable detail
    pub message: String,
}

/// Document served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Camera state copy
    pub camera: CameraState,
    /// Sequence job copy
    pub sequence: SequenceJob,
    /// Stream publication counters
    pub stream: StreamStats,
    /// Derived alerts
    pub alerts: Vec<Alert>,
}

/// Open the first camera and write full-frame RGB24, bandwidth and image controls.
fn open_and_configure(
    hw: &mut dyn HardwareHandle,
    bandwidth: i64,
    settings: &CameraSettings,
) -> Result<DeviceInfo, HwError> {
    let info = hw.open()?;
    hw.configure_format(ImageFormat::Rgb24, info.max_width, info.max_height)?;
    hw.set_control(Control::BandwidthOverload, bandwidth, false)?;
    write_image_controls(hw, settings)?;
    Ok(info)
}

/// Top-level handle on one camera.
pub struct CameraService {
    store: Arc<CameraStateStore>,
    stream: Arc<StreamEngine>,
    runner: ExposureRunner,
    sequence: SequenceController,
    settings: SettingsApplier,
    usb_bandwidth: u32,
    snapshot_config: SnapshotConfig,
    stream_config: StreamConfig,
    connect_lock: tokio::sync::Mutex<()>,
}

impl CameraService {
    /// Build the backend named in the configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let handle: Box<dyn HardwareHandle> = match config.camera.backend {
            Backend::Asi => Box::new(AsiCamera::new(config.camera.library_candidates())),
            Backend::Mock => Box::new(MockCamera::new(
                config.camera.mock_width,
                config.camera.mock_height,
            )),
        };
        tracing::info!(backend = ?config.camera.backend, "Camera backend selected");
        Self::new(handle, config)
    }

    /// Service around an explicit backend.
    pub fn new(handle: Box<dyn HardwareHandle>, config: &ServiceConfig) -> Self {
        let store = Arc::new(CameraStateStore::new(
            handle,
            config.camera.initial_settings(),
        ));
        let stream = Arc::new(StreamEngine::new(Arc::clone(&store), config.stream.clone()));
        let runner = ExposureRunner::new(Arc::clone(&store), config.exposure.clone());
        let sequence = SequenceController::new(
            Arc::clone(&store),
            Arc::clone(&stream),
            runner.clone(),
            config.snapshot.jpeg_quality,
        );
        let settings = SettingsApplier::new(Arc::clone(&store), Arc::clone(&stream));
        Self {
            store,
            stream,
            runner,
            sequence,
            settings,
            usb_bandwidth: config.camera.usb_bandwidth,
            snapshot_config: config.snapshot.clone(),
            stream_config: config.stream.clone(),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// State store.
    pub fn store(&self) -> &Arc<CameraStateStore> {
        &self.store
    }

    /// Stream engine.
    pub fn stream(&self) -> &Arc<StreamEngine> {
        &self.stream
    }

    /// Sequence controller.
    pub fn sequence(&self) -> &SequenceController {
        &self.sequence
    }

    /// Settings applier.
    pub fn settings(&self) -> &SettingsApplier {
        &self.settings
    }

    /// Snapshot encoding and settle time.
    pub fn snapshot_config(&self) -> &SnapshotConfig {
        &self.snapshot_config
    }

    /// Streaming configuration (MJPEG cadence and quality).
    pub fn stream_config(&self) -> &StreamConfig {
        &self.stream_config
    }

    /// Open the camera and write the initial configuration.
    ///
    /// Already connected: returns the current device. After a fatal fault the stale
    /// session is closed before reopening.
    pub async fn connect(&self) -> ServiceResult<DeviceInfo> {
        let _serialised = self.connect_lock.lock().await;
        let state = self.store.snapshot();
        if state.connected {
            if let Some(device) = state.device {
                return Ok(device);
            }
        }

        let settings = state.settings;
        let bandwidth = i64::from(self.usb_bandwidth);
        let opened = self
            .store
            .run_hardware(move |hw| {
                hw.close();
                let result = open_and_configure(hw, bandwidth, &settings);
                if result.is_err() {
                    hw.close();
                }
                result
            })
            .await?;

        match opened {
            Ok(info) => {
                tracing::info!(
                    camera = %info.name,
                    width = info.max_width,
                    height = info.max_height,
                    usb_bandwidth = bandwidth,
                    "Camera connected"
                );
                self.store.mark_connected(info.clone());
                Ok(info)
            }
            Err(e) => {
                tracing::error!(error = %e, "Camera connect failed");
                self.store.mark_disconnected(Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Stop everything, wait for the sequence worker and release the device.
    pub async fn disconnect(&self) -> ServiceResult<()> {
        let _serialised = self.connect_lock.lock().await;
        self.sequence.stop()?;
        self.sequence.join().await;
        self.stream.stop().await?;
        self.store.run_hardware(|hw| hw.close()).await?;
        self.store.mark_disconnected(None);
        self.store.clear_fault();
        self.stream.slot().clear();
        tracing::info!("Camera disconnected");
        Ok(())
    }

    /// Single exposure with the current photo settings.
    ///
    /// An active stream is stopped for the exposure and restarted afterwards, whether
    /// or not the exposure succeeded.
    pub async fn snapshot(&self) -> ServiceResult<Frame> {
        self.store.require_connected()?;
        if self.store.job_busy() {
            return Err(ServiceError::AlreadyRunning);
        }

        let settle = Duration::from_millis(self.snapshot_config.settle_ms);
        let was_streaming = self.stream.is_running().await;
        if was_streaming {
            tracing::debug!("Pausing stream for snapshot");
            self.stream.stop().await?;
            tokio::time::sleep(settle).await;
        }

        let result = self.runner.expose().await;

        if was_streaming {
            tokio::time::sleep(settle).await;
            if let Err(e) = self.stream.start().await {
                tracing::warn!(error = %e, "Could not resume stream after snapshot");
            }
        }
        result
    }

    /// [`snapshot`](Self::snapshot) encoded as JPEG.
    pub async fn snapshot_jpeg(&self) -> ServiceResult<Vec<u8>> {
        let frame = self.snapshot().await?;
        let quality = self.snapshot_config.jpeg_quality;
        tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality)).await?
    }

    /// Status document with derived alerts.
    pub fn status(&self) -> ServiceStatus {
        let camera = self.store.snapshot();
        let sequence = self.sequence.status();
        let mut alerts = Vec::new();

        if !camera.connected {
            alerts.push(Alert {
                kind: AlertKind::CameraDisconnected,
                message: "camera is not connected".to_string(),
            });
        }
        if let Some(fault) = &camera.last_fault {
            alerts.push(Alert {
                kind: AlertKind::HardwareFault,
                message: fault.clone(),
            });
        }
        if sequence.failed_count > 0 {
            alerts.push(Alert {
                kind: AlertKind::SequenceFailures,
                message: format!(
                    "{} of {} photos failed{}",
                    sequence.failed_count,
                    sequence.total_count,
                    sequence
                        .last_error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default()
                ),
            });
        }

        ServiceStatus {
            camera,
            sequence,
            stream: self.stream.slot().stats(),
            alerts,
        }
    }

    /// Stop the sequence and stream, wait for the workers and close the device.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down camera service");
        if let Err(e) = self.sequence.stop() {
            tracing::warn!(error = %e, "Stopping sequence during shutdown failed");
        }
        self.sequence.join().await;
        if let Err(e) = self.stream.stop().await {
            tracing::warn!(error = %e, "Stopping stream during shutdown failed");
        }
        match self.store.run_hardware(|hw| hw.close()).await {
            Ok(()) => self.store.mark_disconnected(None),
            Err(e) => tracing::warn!(error = %e, "Closing camera during shutdown failed"),
        }
    }
}
