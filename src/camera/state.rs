//! Camera State Store
//!
//! Single source of truth for the camera and owner of the hardware gate.
//!
//! Two locks live here and they are never nested:
//!
//! - the **state lock** guards [`CameraState`]; it is held for a copy or a field update only
//! - the **gate** guards the boxed [`HardwareHandle`]; it is held for exactly one blocking
//!   hardware call (or one short protocol such as connect), always on the blocking pool
//!
//! Mode changes go through [`CameraStateStore::transition`] / [`CameraStateStore::enter`],
//! which enforce the state machine:
//!
//! ```text
//!   Streaming  <──>  Idle  <──>  Exposing
//! ```
//!
//! There is no direct edge between `Streaming` and `Exposing`.

use crate::error::{HwError, ServiceError, ServiceResult, StateError};
use crate::hardware::{DeviceInfo, HardwareHandle, ImageFormat};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What the sensor is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Open, nothing running
    #[default]
    Idle,
    /// Video capture with the acquisition loop running
    Streaming,
    /// Single exposure in flight
    Exposing,
}

impl Mode {
    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(self, to: Mode) -> bool {
        matches!(
            (self, to),
            (Mode::Idle, Mode::Streaming)
                | (Mode::Streaming, Mode::Idle)
                | (Mode::Idle, Mode::Exposing)
                | (Mode::Exposing, Mode::Idle)
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Idle => "idle",
            Mode::Streaming => "streaming",
            Mode::Exposing => "exposing",
        })
    }
}

/// User-adjustable capture settings.
///
/// Stored values survive disconnects; they are written to the hardware at the next
/// connect, stream start or exposure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraSettings {
    /// Analogue gain, 0-100
    pub gain: u32,
    /// Single-exposure time in microseconds
    #[serde(rename = "photo_exposure")]
    pub photo_exposure_us: u64,
    /// Auto-exposure ceiling for streaming, in microseconds
    #[serde(rename = "video_exposure")]
    pub video_exposure_us: u64,
    /// Format used for exposures (video always runs RGB24)
    pub image_format: ImageFormat,
    /// Gamma, 1-100
    pub gamma: u32,
    /// Red white-balance, 1-99
    pub wb_r: u32,
    /// Blue white-balance, 1-99
    pub wb_b: u32,
    /// Let the camera pick white balance
    pub wb_auto: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            gain: 50,
            photo_exposure_us: 1_000_000,
            video_exposure_us: 100_000,
            image_format: ImageFormat::Rgb24,
            gamma: 50,
            wb_r: 52,
            wb_b: 95,
            wb_auto: false,
        }
    }
}

/// Consistent copy of the camera state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraState {
    /// Device opened and initialised
    pub connected: bool,
    /// Current mode
    pub mode: Mode,
    /// Sensor width, fixed at connect time
    pub width: u32,
    /// Sensor height, fixed at connect time
    pub height: u32,
    /// Capture settings
    #[serde(flatten)]
    pub settings: CameraSettings,
    /// Last hardware fault, cleared on the next successful operation
    pub last_fault: Option<String>,
    /// Device description from the last successful open
    pub device: Option<DeviceInfo>,
}

/// Owner of [`CameraState`] and of the hardware gate.
pub struct CameraStateStore {
    state: Mutex<CameraState>,
    gate: Arc<Mutex<Box<dyn HardwareHandle>>>,
    // Held by a sequence job or batch from start until its worker exits.
    job_busy: AtomicBool,
}

impl CameraStateStore {
    /// Wrap a (not yet opened) backend.
    pub fn new(handle: Box<dyn HardwareHandle>, settings: CameraSettings) -> Self {
        Self {
            state: Mutex::new(CameraState {
                connected: false,
                mode: Mode::Idle,
                width: 0,
                height: 0,
                settings,
                last_fault: None,
                device: None,
            }),
            gate: Arc::new(Mutex::new(handle)),
            job_busy: AtomicBool::new(false),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> CameraState {
        self.state.lock().clone()
    }

    /// Copy of the stored settings.
    pub fn settings(&self) -> CameraSettings {
        self.state.lock().settings.clone()
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Move the state machine to `to`.
    ///
    /// # Errors
    /// [`StateError::InvalidTransition`] if there is no edge from the current mode.
    pub fn transition(&self, to: Mode) -> Result<(), StateError> {
        let mut state = self.state.lock();
        if !state.mode.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                from: state.mode,
                to,
            });
        }
        tracing::debug!(from = %state.mode, %to, "Camera mode transition");
        state.mode = to;
        Ok(())
    }

    /// Leave `Idle` for `to`, requiring an open camera. Both checks happen under one lock.
    pub fn enter(&self, to: Mode) -> ServiceResult<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(ServiceError::NotConnected);
        }
        if !state.mode.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                from: state.mode,
                to,
            }
            .into());
        }
        tracing::debug!(from = %state.mode, %to, "Camera mode transition");
        state.mode = to;
        Ok(())
    }

    /// Return to `Idle` if the camera is still in `from`.
    ///
    /// Returns `false` when someone else already moved the mode on (for example a
    /// disconnect forced it to `Idle`).
    pub fn leave(&self, from: Mode) -> bool {
        let mut state = self.state.lock();
        if state.mode == from {
            tracing::debug!(%from, "Camera mode transition to idle");
            state.mode = Mode::Idle;
            true
        } else {
            false
        }
    }

    /// Whether a sequence job or batch owns the camera.
    pub fn job_busy(&self) -> bool {
        self.job_busy.load(Ordering::Acquire)
    }

    /// Claim the camera for a sequence job or batch. `false` if already claimed.
    pub(crate) fn try_claim_job(&self) -> bool {
        self.job_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_job(&self) {
        self.job_busy.store(false, Ordering::Release);
    }

    /// Fail with [`ServiceError::NotConnected`] unless the camera is open.
    pub fn require_connected(&self) -> ServiceResult<()> {
        if self.state.lock().connected {
            Ok(())
        } else {
            Err(ServiceError::NotConnected)
        }
    }

    /// Run `f` with exclusive access to the hardware on the current thread.
    ///
    /// Blocks until the gate is free. Only call from blocking contexts.
    pub fn with_hardware<R>(&self, f: impl FnOnce(&mut dyn HardwareHandle) -> R) -> R {
        let mut hw = self.gate.lock();
        f(hw.as_mut())
    }

    /// Run `f` with exclusive access to the hardware on the blocking pool.
    pub async fn run_hardware<R, F>(&self, f: F) -> ServiceResult<R>
    where
        F: FnOnce(&mut dyn HardwareHandle) -> R + Send + 'static,
        R: Send + 'static,
    {
        let gate = Arc::clone(&self.gate);
        let out = tokio::task::spawn_blocking(move || {
            let mut hw = gate.lock();
            f(hw.as_mut())
        })
        .await?;
        Ok(out)
    }

    /// Replace the stored settings.
    pub(crate) fn commit_settings(&self, settings: CameraSettings) {
        self.state.lock().settings = settings;
    }

    /// Record a successful open.
    pub(crate) fn mark_connected(&self, info: DeviceInfo) {
        let mut state = self.state.lock();
        state.connected = true;
        state.mode = Mode::Idle;
        state.width = info.max_width;
        state.height = info.max_height;
        state.last_fault = None;
        state.device = Some(info);
    }

    /// Record the loss (or release) of the device session.
    pub(crate) fn mark_disconnected(&self, reason: Option<String>) {
        let mut state = self.state.lock();
        state.connected = false;
        state.mode = Mode::Idle;
        if reason.is_some() {
            state.last_fault = reason;
        }
    }

    /// Store a fault message for `/status`.
    pub(crate) fn record_fault(&self, fault: impl fmt::Display) {
        let message = fault.to_string();
        tracing::warn!(fault = %message, "Camera fault recorded");
        self.state.lock().last_fault = Some(message);
    }

    /// Store a hardware fault; fatal ones also drop the connection.
    pub(crate) fn record_hw_error(&self, err: &HwError) {
        if err.is_fatal() {
            tracing::error!(error = %err, "Camera session lost");
            self.mark_disconnected(Some(err.to_string()));
        } else {
            self.record_fault(err);
        }
    }

    /// Same as [`record_hw_error`](Self::record_hw_error) for errors already lifted to the service level.
    pub(crate) fn record_service_error(&self, err: &ServiceError) {
        match err {
            ServiceError::Hardware(hw) => self.record_hw_error(hw),
            ServiceError::NotConnected
            | ServiceError::State(_)
            | ServiceError::AlreadyRunning
            | ServiceError::StreamNotRunning => {}
            other => self.record_fault(other),
        }
    }

    /// Forget the last fault after a successful operation.
    pub(crate) fn clear_fault(&self) {
        self.state.lock().last_fault = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCamera;

    fn store() -> CameraStateStore {
        CameraStateStore::new(Box::new(MockCamera::new(64, 48)), CameraSettings::default())
    }

    fn connected_store() -> CameraStateStore {
        let store = store();
        let info = store.with_hardware(|hw| hw.open()).unwrap();
        store.mark_connected(info);
        store
    }

    #[test]
    fn only_documented_edges_exist() {
        use Mode::*;
        for from in [Idle, Streaming, Exposing] {
            for to in [Idle, Streaming, Exposing] {
                let expected = matches!(
                    (from, to),
                    (Idle, Streaming) | (Streaming, Idle) | (Idle, Exposing) | (Exposing, Idle)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn streaming_to_exposing_is_rejected() {
        let store = connected_store();
        store.transition(Mode::Streaming).unwrap();
        assert_eq!(
            store.transition(Mode::Exposing),
            Err(StateError::InvalidTransition {
                from: Mode::Streaming,
                to: Mode::Exposing
            })
        );
        assert_eq!(store.mode(), Mode::Streaming);
    }

    #[test]
    fn enter_requires_connection() {
        let store = store();
        assert!(matches!(
            store.enter(Mode::Streaming),
            Err(ServiceError::NotConnected)
        ));
        assert_eq!(store.mode(), Mode::Idle);
    }

    #[test]
    fn connect_takes_geometry_from_device() {
        let store = connected_store();
        let state = store.snapshot();
        assert!(state.connected);
        assert_eq!((state.width, state.height), (64, 48));
        assert_eq!(state.device.map(|d| d.name), Some("ZWO ASI Simulator".into()));
    }

    #[test]
    fn fatal_errors_disconnect_transient_errors_do_not() {
        let store = connected_store();
        store.transition(Mode::Exposing).unwrap();

        store.record_hw_error(&HwError::Timeout);
        let state = store.snapshot();
        assert!(state.connected);
        assert_eq!(state.mode, Mode::Exposing);
        assert!(state.last_fault.is_some());

        store.record_hw_error(&HwError::Disconnected);
        let state = store.snapshot();
        assert!(!state.connected);
        assert_eq!(state.mode, Mode::Idle);
        assert_eq!(state.last_fault.as_deref(), Some("camera disconnected"));
    }

    #[test]
    fn leave_only_resets_matching_mode() {
        let store = connected_store();
        store.transition(Mode::Streaming).unwrap();
        assert!(!store.leave(Mode::Exposing));
        assert!(store.leave(Mode::Streaming));
        assert_eq!(store.mode(), Mode::Idle);
    }

    #[test]
    fn state_serializes_settings_inline() {
        let json = serde_json::to_value(store().snapshot()).unwrap();
        assert_eq!(json["gain"], 50);
        assert_eq!(json["photo_exposure"], 1_000_000);
        assert_eq!(json["image_format"], "RGB24");
        assert_eq!(json["mode"], "idle");
    }

    #[tokio::test]
    async fn run_hardware_hops_to_blocking_pool() {
        let store = store();
        let info = store.run_hardware(|hw| hw.open()).await.unwrap().unwrap();
        assert_eq!(info.max_width, 64);
    }

    #[test]
    fn job_claim_is_exclusive() {
        let store = store();
        assert!(!store.job_busy());
        assert!(store.try_claim_job());
        assert!(!store.try_claim_job());
        assert!(store.job_busy());
        store.release_job();
        assert!(store.try_claim_job());
    }
}
