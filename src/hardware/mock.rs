//! Mock Camera
//!
//! Simulated ASI-style camera for tests and for running the service without hardware
//! (`asicam serve --mock`).
//!
//! # Behaviour
//!
//! - Video frames arrive every `frame_interval` (default 20 ms)
//! - Exposures complete after `exposure_duration` (default 10 ms), or after the written
//!   exposure control when [`MockCamera::honor_exposure_time`] is enabled
//! - Every pixel byte carries the current gain (clamped to 255), so tests can tell which
//!   settings a frame was captured with
//! - Format checks follow the ASI rules: width a multiple of 8, height a multiple of 2,
//!   neither larger than the sensor
//!
//! # Fault Injection
//!
//! A [`MockController`] shares state with the camera after it has been boxed behind the
//! state store. Faults are queued with [`MockController::inject`]:
//!
//! ```rust,ignore
//! let camera = MockCamera::new(64, 48);
//! let ctl = camera.controller();
//! ctl.inject(MockFault::DisconnectOnExposure { nth: 2 });
//! ```

use crate::error::HwError;
use crate::hardware::{Control, DeviceInfo, ExposureStatus, Frame, HardwareHandle, ImageFormat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ASI_ERROR_INVALID_SIZE: i32 = 8;
const ASI_ERROR_INVALID_SEQUENCE: i32 = 12;

/// Scripted failure for the simulated camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// Enumeration finds nothing.
    NoDevice,
    /// The `nth` exposure start (1-based, counted since creation) unplugs the camera.
    DisconnectOnExposure {
        /// Exposure number that fails
        nth: u32,
    },
    /// The `nth` exposure reports `Failed` instead of `Success`.
    FailExposure {
        /// Exposure number that fails
        nth: u32,
    },
    /// The `nth` exposure never completes.
    HangExposure {
        /// Exposure number that hangs
        nth: u32,
    },
    /// An exposure left over from a previous session is still reported as running.
    StuckExposure,
    /// The next `count` video polls time out.
    VideoTimeouts {
        /// Number of timeouts to produce
        count: u32,
    },
    /// The next video poll unplugs the camera.
    DisconnectOnVideo,
}

#[derive(Debug)]
struct PendingExposure {
    started: Instant,
    duration: Duration,
    fail: bool,
    hang: bool,
}

impl PendingExposure {
    fn stuck() -> Self {
        Self {
            started: Instant::now(),
            duration: Duration::ZERO,
            fail: false,
            hang: true,
        }
    }

    fn in_progress(&self) -> bool {
        self.hang || self.started.elapsed() < self.duration
    }
}

#[derive(Debug)]
struct MockState {
    info: DeviceInfo,
    open: bool,
    present: bool,
    roi: (ImageFormat, u32, u32),
    controls: HashMap<Control, (i64, bool)>,
    streaming: bool,
    exposure: Option<PendingExposure>,
    faults: Vec<MockFault>,
    frame_interval: Duration,
    exposure_duration: Duration,
    honor_exposure_time: bool,
    exposures_started: u32,
    exposures_aborted: u32,
    video_frames: u64,
    opens: u32,
}

impl MockState {
    fn require_session(&self) -> Result<(), HwError> {
        if !self.open {
            return Err(HwError::NotOpen);
        }
        if !self.present {
            return Err(HwError::Disconnected);
        }
        Ok(())
    }

    /// Remove the first fault matching `pred`.
    fn take_fault(&mut self, pred: impl Fn(&MockFault) -> bool) -> Option<MockFault> {
        let idx = self.faults.iter().position(pred)?;
        Some(self.faults.remove(idx))
    }

    fn has_fault(&self, pred: impl Fn(&MockFault) -> bool) -> bool {
        self.faults.iter().any(pred)
    }

    fn frame(&self) -> Frame {
        let (format, width, height) = self.roi;
        let gain = self.controls.get(&Control::Gain).map_or(0, |(v, _)| *v);
        let fill = u8::try_from(gain.clamp(0, 255)).unwrap_or(u8::MAX);
        Frame::new(
            format,
            width,
            height,
            vec![fill; Frame::expected_len(format, width, height)],
        )
    }
}

/// Simulated camera implementing [`HardwareHandle`].
pub struct MockCamera {
    shared: Arc<Mutex<MockState>>,
}

impl MockCamera {
    /// Colour camera with the given sensor size.
    pub fn new(max_width: u32, max_height: u32) -> Self {
        let info = DeviceInfo {
            name: "ZWO ASI Simulator".to_string(),
            camera_id: 0,
            max_width,
            max_height,
            is_color: true,
            bit_depth: 12,
            pixel_size_um: 3.75,
            usb3: true,
        };
        Self {
            shared: Arc::new(Mutex::new(MockState {
                roi: (ImageFormat::Raw8, max_width, max_height),
                info,
                open: false,
                present: true,
                controls: HashMap::new(),
                streaming: false,
                exposure: None,
                faults: Vec::new(),
                frame_interval: Duration::from_millis(20),
                exposure_duration: Duration::from_millis(10),
                honor_exposure_time: false,
                exposures_started: 0,
                exposures_aborted: 0,
                video_frames: 0,
                opens: 0,
            })),
        }
    }

    /// Handle for inspecting and scripting this camera after it has been boxed.
    pub fn controller(&self) -> MockController {
        MockController {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Set the simulated video frame period.
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.shared.lock().frame_interval = interval;
        self
    }

    /// Set how long exposures take when the exposure control is ignored.
    pub fn with_exposure_duration(self, duration: Duration) -> Self {
        self.shared.lock().exposure_duration = duration;
        self
    }

    /// Let exposures last as long as the written exposure control says.
    pub fn honor_exposure_time(self, honor: bool) -> Self {
        self.shared.lock().honor_exposure_time = honor;
        self
    }
}

impl HardwareHandle for MockCamera {
    fn open(&mut self) -> Result<DeviceInfo, HwError> {
        let mut state = self.shared.lock();
        if state.has_fault(|f| *f == MockFault::NoDevice) {
            return Err(HwError::NoDeviceFound);
        }
        if state.take_fault(|f| *f == MockFault::StuckExposure).is_some() {
            state.exposure = Some(PendingExposure::stuck());
        }
        state.open = true;
        state.present = true;
        state.streaming = false;
        state.opens += 1;
        let (w, h) = (state.info.max_width, state.info.max_height);
        state.roi = (ImageFormat::Raw8, w, h);
        tracing::debug!(camera = %state.info.name, "Mock camera opened");
        Ok(state.info.clone())
    }

    fn configure_format(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<(), HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        let fits = width > 0
            && height > 0
            && width <= state.info.max_width
            && height <= state.info.max_height
            && width % 8 == 0
            && height % 2 == 0;
        if !fits {
            return Err(HwError::FormatUnsupported {
                format,
                width,
                height,
                code: ASI_ERROR_INVALID_SIZE,
            });
        }
        state.roi = (format, width, height);
        Ok(())
    }

    fn set_control(&mut self, control: Control, value: i64, auto: bool) -> Result<(), HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        state.controls.insert(control, (value, auto));
        Ok(())
    }

    fn start_video_capture(&mut self) -> Result<(), HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        if state.exposure.as_ref().is_some_and(PendingExposure::in_progress) {
            return Err(HwError::AlreadyExposing);
        }
        state.streaming = true;
        Ok(())
    }

    fn poll_video_frame(&mut self, timeout: Duration) -> Result<Frame, HwError> {
        let (wait, outcome) = {
            let mut state = self.shared.lock();
            state.require_session()?;
            if !state.streaming {
                return Err(HwError::Sdk {
                    operation: "ASIGetVideoData",
                    code: ASI_ERROR_INVALID_SEQUENCE,
                });
            }
            if state
                .take_fault(|f| *f == MockFault::DisconnectOnVideo)
                .is_some()
            {
                state.present = false;
                state.streaming = false;
                return Err(HwError::Disconnected);
            }
            let timeout_left = state.faults.iter_mut().find_map(|f| match f {
                MockFault::VideoTimeouts { count } if *count > 0 => {
                    *count -= 1;
                    Some(*count)
                }
                _ => None,
            });
            match timeout_left {
                Some(0) => {
                    state.take_fault(|f| matches!(f, MockFault::VideoTimeouts { count: 0 }));
                    (state.frame_interval.min(timeout), Err(HwError::Timeout))
                }
                Some(_) => (state.frame_interval.min(timeout), Err(HwError::Timeout)),
                None => (state.frame_interval, Ok(())),
            }
        };

        // Simulated readout happens without holding the lock.
        std::thread::sleep(wait);
        outcome?;

        let mut state = self.shared.lock();
        state.require_session()?;
        state.video_frames += 1;
        Ok(state.frame())
    }

    fn stop_video_capture(&mut self) -> Result<(), HwError> {
        self.shared.lock().streaming = false;
        Ok(())
    }

    fn start_exposure(&mut self) -> Result<(), HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        if state.streaming {
            return Err(HwError::VideoModeActive);
        }
        if state.exposure.as_ref().is_some_and(PendingExposure::in_progress) {
            return Err(HwError::AlreadyExposing);
        }
        state.exposures_started += 1;
        let nth = state.exposures_started;

        if state
            .take_fault(|f| *f == MockFault::DisconnectOnExposure { nth })
            .is_some()
        {
            state.present = false;
            tracing::debug!(nth, "Mock camera unplugged during exposure start");
            return Err(HwError::Disconnected);
        }
        let fail = state
            .take_fault(|f| *f == MockFault::FailExposure { nth })
            .is_some();
        let hang = state
            .take_fault(|f| *f == MockFault::HangExposure { nth })
            .is_some();

        let duration = if state.honor_exposure_time {
            let us = state.controls.get(&Control::Exposure).map_or(0, |(v, _)| *v);
            Duration::from_micros(u64::try_from(us).unwrap_or(0))
        } else {
            state.exposure_duration
        };
        state.exposure = Some(PendingExposure {
            started: Instant::now(),
            duration,
            fail,
            hang,
        });
        Ok(())
    }

    fn poll_exposure_status(&mut self) -> Result<ExposureStatus, HwError> {
        let state = self.shared.lock();
        state.require_session()?;
        Ok(match &state.exposure {
            None => ExposureStatus::Idle,
            Some(exp) if exp.in_progress() => ExposureStatus::InProgress,
            Some(exp) if exp.fail => ExposureStatus::Failed,
            Some(_) => ExposureStatus::Success,
        })
    }

    fn fetch_exposed_frame(&mut self) -> Result<Frame, HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        let ready = matches!(
            &state.exposure,
            Some(exp) if !exp.fail && !exp.in_progress()
        );
        if !ready {
            return Err(HwError::Sdk {
                operation: "ASIGetDataAfterExp",
                code: ASI_ERROR_INVALID_SEQUENCE,
            });
        }
        state.exposure = None;
        Ok(state.frame())
    }

    fn abort_exposure(&mut self) -> Result<(), HwError> {
        let mut state = self.shared.lock();
        state.require_session()?;
        if state.exposure.take().is_some() {
            state.exposures_aborted += 1;
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.shared.lock();
        state.open = false;
        state.streaming = false;
        state.exposure = None;
    }
}

/// Test-side handle onto a [`MockCamera`].
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Mutex<MockState>>,
}

impl MockController {
    /// Queue a fault.
    ///
    /// `StuckExposure` takes effect immediately on an open camera.
    pub fn inject(&self, fault: MockFault) {
        let mut state = self.shared.lock();
        if fault == MockFault::StuckExposure && state.open {
            state.exposure = Some(PendingExposure::stuck());
        } else {
            state.faults.push(fault);
        }
    }

    /// Drop all queued faults.
    pub fn clear_faults(&self) {
        self.shared.lock().faults.clear();
    }

    /// Simulate pulling the USB cable.
    pub fn unplug(&self) {
        let mut state = self.shared.lock();
        state.present = false;
        state.streaming = false;
    }

    /// Last value written to `control`.
    pub fn control(&self, control: Control) -> Option<i64> {
        self.shared.lock().controls.get(&control).map(|(v, _)| *v)
    }

    /// Auto flag last written with `control`.
    pub fn control_auto(&self, control: Control) -> Option<bool> {
        self.shared.lock().controls.get(&control).map(|(_, a)| *a)
    }

    /// Active format and region of interest.
    pub fn format(&self) -> (ImageFormat, u32, u32) {
        self.shared.lock().roi
    }

    /// Whether video capture is running.
    pub fn is_streaming(&self) -> bool {
        self.shared.lock().streaming
    }

    /// Whether the session is open.
    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    /// Exposures started since creation.
    pub fn exposures_started(&self) -> u32 {
        self.shared.lock().exposures_started
    }

    /// Exposures abandoned through `abort_exposure`.
    pub fn exposures_aborted(&self) -> u32 {
        self.shared.lock().exposures_aborted
    }

    /// Video frames delivered since creation.
    pub fn video_frames(&self) -> u64 {
        self.shared.lock().video_frames
    }

    /// Number of successful `open()` calls.
    pub fn opens(&self) -> u32 {
        self.shared.lock().opens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> (MockCamera, MockController) {
        let mut camera = MockCamera::new(64, 48).with_frame_interval(Duration::from_millis(1));
        let ctl = camera.controller();
        camera.open().unwrap();
        (camera, ctl)
    }

    #[test]
    fn frames_carry_gain() {
        let (mut camera, _) = opened();
        camera.configure_format(ImageFormat::Rgb24, 64, 48).unwrap();
        camera.set_control(Control::Gain, 70, false).unwrap();
        camera.start_video_capture().unwrap();
        let frame = camera.poll_video_frame(Duration::from_millis(100)).unwrap();
        assert!(frame.is_complete());
        assert!(frame.bytes.iter().all(|&b| b == 70));
    }

    #[test]
    fn rejects_misaligned_roi() {
        let (mut camera, _) = opened();
        assert!(matches!(
            camera.configure_format(ImageFormat::Raw8, 60, 48),
            Err(HwError::FormatUnsupported { code: 8, .. })
        ));
        assert!(camera.configure_format(ImageFormat::Raw8, 128, 48).is_err());
        assert!(camera.configure_format(ImageFormat::Raw16, 32, 24).is_ok());
    }

    #[test]
    fn video_and_exposure_are_exclusive() {
        let (mut camera, _) = opened();
        camera.start_video_capture().unwrap();
        assert_eq!(camera.start_exposure(), Err(HwError::VideoModeActive));
        camera.stop_video_capture().unwrap();
        camera.start_exposure().unwrap();
        assert_eq!(camera.start_video_capture(), Err(HwError::AlreadyExposing));
    }

    #[test]
    fn exposure_completes_and_is_fetched_once() {
        let (mut camera, _) = opened();
        camera.start_exposure().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(camera.poll_exposure_status().unwrap(), ExposureStatus::Success);
        assert!(camera.fetch_exposed_frame().is_ok());
        assert_eq!(camera.poll_exposure_status().unwrap(), ExposureStatus::Idle);
        assert!(camera.fetch_exposed_frame().is_err());
    }

    #[test]
    fn scripted_disconnect_hits_the_nth_exposure() {
        let (mut camera, ctl) = opened();
        ctl.inject(MockFault::DisconnectOnExposure { nth: 2 });
        camera.start_exposure().unwrap();
        camera.abort_exposure().unwrap();
        assert_eq!(camera.start_exposure(), Err(HwError::Disconnected));
        assert_eq!(camera.poll_exposure_status(), Err(HwError::Disconnected));

        // Reopening plugs it back in.
        camera.open().unwrap();
        assert_eq!(ctl.opens(), 2);
        assert!(camera.start_exposure().is_ok());
    }

    #[test]
    fn video_timeouts_are_consumed() {
        let (mut camera, ctl) = opened();
        ctl.inject(MockFault::VideoTimeouts { count: 2 });
        camera.start_video_capture().unwrap();
        let timeout = Duration::from_millis(5);
        assert_eq!(camera.poll_video_frame(timeout), Err(HwError::Timeout));
        assert_eq!(camera.poll_video_frame(timeout), Err(HwError::Timeout));
        assert!(camera.poll_video_frame(timeout).is_ok());
        assert_eq!(ctl.video_frames(), 1);
    }

    #[test]
    fn stuck_exposure_survives_reopen_until_aborted() {
        let mut camera = MockCamera::new(64, 48);
        let ctl = camera.controller();
        ctl.inject(MockFault::StuckExposure);
        camera.open().unwrap();
        assert_eq!(camera.poll_exposure_status().unwrap(), ExposureStatus::InProgress);
        camera.abort_exposure().unwrap();
        assert_eq!(camera.poll_exposure_status().unwrap(), ExposureStatus::Idle);
        assert_eq!(ctl.exposures_aborted(), 1);
    }
}
