//! Hardware Handle Capability
//!
//! The single point of contact with a camera backend. The stream engine, the exposure
//! runner and the settings applier only ever call these methods; they never see SDK
//! function pointers or simulator internals.
//!
//! # Design Philosophy
//!
//! The trait is deliberately synchronous: the vendor SDK blocks inside every call and is
//! not safe to drive from two threads at once. Callers own the threading:
//!
//! - the handle lives behind the gate in [`CameraStateStore`](crate::camera::state::CameraStateStore)
//! - async callers hop onto the blocking pool (`spawn_blocking`) before taking the gate
//! - the gate is held for one call at a time, never across a loop
//!
//! Implementations report raw outcomes as [`HwError`] and must not clamp or reinterpret
//! values; range validation happens before the handle is reached.
//!
//! # Example
//!
//! ```rust,ignore
//! use asicam::hardware::{Control, HardwareHandle, ImageFormat};
//! use asicam::hardware::mock::MockCamera;
//!
//! let mut camera = MockCamera::new(640, 480);
//! let info = camera.open()?;
//! camera.configure_format(ImageFormat::Rgb24, info.max_width, info.max_height)?;
//! camera.set_control(Control::Gain, 50, false)?;
//! camera.start_video_capture()?;
//! let frame = camera.poll_video_frame(std::time::Duration::from_secs(2))?;
//! camera.stop_video_capture()?;
//! camera.close();
//! ```

use crate::error::HwError;
use crate::hardware::{Control, DeviceInfo, ExposureStatus, Frame, ImageFormat};
use std::time::Duration;

/// Capability: exclusive access to one imaging sensor.
///
/// # Contract
/// - `open` must succeed before any other call; other calls return [`HwError::NotOpen`] otherwise
/// - `configure_format` must be called whenever the active image format changes
/// - video capture and exposures are mutually exclusive; backends double-check this
/// - `stop_video_capture` and `close` are idempotent
pub trait HardwareHandle: Send {
    /// Enumerate devices, then open and initialise the first one.
    ///
    /// # Errors
    /// - [`HwError::NoDeviceFound`] if nothing is connected
    /// - [`HwError::InitFailed`] on any non-success native code
    fn open(&mut self) -> Result<DeviceInfo, HwError>;

    /// Select pixel format and region of interest (full-frame origin, bin 1).
    ///
    /// # Errors
    /// [`HwError::FormatUnsupported`] if the sensor rejects the combination.
    fn configure_format(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<(), HwError>;

    /// Write one control. Values are passed through unclamped.
    ///
    /// # Errors
    /// [`HwError::ControlRejected`] with the native code.
    fn set_control(&mut self, control: Control, value: i64, auto: bool) -> Result<(), HwError>;

    /// Enter continuous video mode.
    ///
    /// # Errors
    /// [`HwError::AlreadyExposing`] if a single exposure is running.
    fn start_video_capture(&mut self) -> Result<(), HwError>;

    /// Wait up to `timeout` for the next video frame.
    ///
    /// # Errors
    /// - [`HwError::Timeout`]: nothing arrived, caller may retry
    /// - [`HwError::Disconnected`]: the session is gone
    fn poll_video_frame(&mut self, timeout: Duration) -> Result<Frame, HwError>;

    /// Leave video mode. Calling while not streaming is a successful no-op.
    fn stop_video_capture(&mut self) -> Result<(), HwError>;

    /// Begin a single (light) exposure with the currently written controls.
    ///
    /// # Errors
    /// [`HwError::VideoModeActive`] if video capture is running.
    fn start_exposure(&mut self) -> Result<(), HwError>;

    /// Query the state of the running exposure. Never blocks.
    fn poll_exposure_status(&mut self) -> Result<ExposureStatus, HwError>;

    /// Read out the frame of a successful exposure.
    fn fetch_exposed_frame(&mut self) -> Result<Frame, HwError>;

    /// Abandon a running exposure so the sensor returns to idle.
    ///
    /// Used as the recovery path for exposures that never complete.
    fn abort_exposure(&mut self) -> Result<(), HwError>;

    /// Release the device. Safe to call repeatedly.
    fn close(&mut self);
}
