//! ZWO ASI Camera Driver
//!
//! Reference: ASICamera2 SDK (`ASICamera2.h`, SDK V1.40)
//!
//! Protocol Overview:
//! - The vendor library is loaded at runtime with `libloading`; the candidate paths come
//!   from configuration and are selected per CPU architecture
//! - Every SDK function returns an `ASI_ERROR_CODE`; [`map_code`] folds the codes into
//!   [`HwError`] so nothing above this module sees raw integers
//! - Video mode: `ASIStartVideoCapture` → repeated `ASIGetVideoData` → `ASIStopVideoCapture`
//! - Snap mode: `ASIStartExposure` → poll `ASIGetExpStatus` → `ASIGetDataAfterExp`
//!
//! Thread Safety: the SDK is not re-entrant per camera. `AsiCamera` is `Send` but not
//! `Sync`; the camera state store keeps it behind its gate.

#![allow(dead_code)] // FFI types must match SDK headers even if not all fields are read
#![allow(unsafe_code)] // FFI boundary; every block carries a SAFETY note

use crate::error::HwError;
use crate::hardware::{Control, DeviceInfo, ExposureStatus, Frame, HardwareHandle, ImageFormat};
use libloading::Library;
use std::ffi::{c_char, c_int, c_long};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// SDK CONSTANTS
// =============================================================================

const ASI_SUCCESS: c_int = 0;
const ASI_FALSE: c_int = 0;
const ASI_TRUE: c_int = 1;

const ASI_ERROR_CAMERA_CLOSED: c_int = 4;
const ASI_ERROR_CAMERA_REMOVED: c_int = 5;
const ASI_ERROR_INVALID_SIZE: c_int = 8;
const ASI_ERROR_INVALID_IMGTYPE: c_int = 9;
const ASI_ERROR_TIMEOUT: c_int = 11;
const ASI_ERROR_INVALID_SEQUENCE: c_int = 12;
const ASI_ERROR_VIDEO_MODE_ACTIVE: c_int = 14;
const ASI_ERROR_EXPOSURE_IN_PROGRESS: c_int = 15;

/// Symbolic names of `ASI_ERROR_CODE`, indexed by value.
const ERROR_NAMES: [&str; 18] = [
    "ASI_SUCCESS",
    "ASI_ERROR_INVALID_INDEX",
    "ASI_ERROR_INVALID_ID",
    "ASI_ERROR_INVALID_CONTROL_TYPE",
    "ASI_ERROR_CAMERA_CLOSED",
    "ASI_ERROR_CAMERA_REMOVED",
    "ASI_ERROR_INVALID_PATH",
    "ASI_ERROR_INVALID_FILEFORMAT",
    "ASI_ERROR_INVALID_SIZE",
    "ASI_ERROR_INVALID_IMGTYPE",
    "ASI_ERROR_OUTOF_BOUNDARY",
    "ASI_ERROR_TIMEOUT",
    "ASI_ERROR_INVALID_SEQUENCE",
    "ASI_ERROR_BUFFER_TOO_SMALL",
    "ASI_ERROR_VIDEO_MODE_ACTIVE",
    "ASI_ERROR_EXPOSURE_IN_PROGRESS",
    "ASI_ERROR_GENERAL_ERROR",
    "ASI_ERROR_INVALID_MODE",
];

/// Name of an ASI return code, for log and error messages.
pub fn error_name(code: i32) -> &'static str {
    usize::try_from(code)
        .ok()
        .and_then(|idx| ERROR_NAMES.get(idx))
        .copied()
        .unwrap_or("ASI_ERROR_UNKNOWN")
}

/// Translate a non-success return code.
fn map_code(operation: &'static str, code: c_int) -> HwError {
    match code {
        ASI_ERROR_CAMERA_CLOSED | ASI_ERROR_CAMERA_REMOVED => HwError::Disconnected,
        ASI_ERROR_TIMEOUT => HwError::Timeout,
        ASI_ERROR_VIDEO_MODE_ACTIVE => HwError::VideoModeActive,
        ASI_ERROR_EXPOSURE_IN_PROGRESS => HwError::AlreadyExposing,
        _ => HwError::Sdk { operation, code },
    }
}

fn check(operation: &'static str, code: c_int) -> Result<(), HwError> {
    if code == ASI_SUCCESS {
        Ok(())
    } else {
        Err(map_code(operation, code))
    }
}

fn img_type(format: ImageFormat) -> c_int {
    match format {
        ImageFormat::Raw8 => 0,
        ImageFormat::Rgb24 => 1,
        ImageFormat::Raw16 => 2,
        ImageFormat::Y8 => 3,
    }
}

// Order from ASICamera2.h (ASI_CONTROL_TYPE).
fn control_type(control: Control) -> c_int {
    match control {
        Control::Gain => 0,
        Control::Exposure => 1,
        Control::Gamma => 2,
        Control::WbR => 3,
        Control::WbB => 4,
        Control::BandwidthOverload => 6,
        Control::AutoMaxExposure => 11,
    }
}

fn exposure_status(raw: c_int) -> ExposureStatus {
    match raw {
        1 => ExposureStatus::InProgress,
        2 => ExposureStatus::Success,
        3 => ExposureStatus::Failed,
        _ => ExposureStatus::Idle,
    }
}

// =============================================================================
// SDK TYPE DEFINITIONS
// =============================================================================

/// `ASI_CAMERA_INFO` from ASICamera2.h
#[repr(C)]
struct AsiCameraInfo {
    name: [c_char; 64],
    camera_id: c_int,
    max_height: c_long,
    max_width: c_long,
    is_color_cam: c_int,
    bayer_pattern: c_int,
    supported_bins: [c_int; 16],
    supported_video_format: [c_int; 8],
    pixel_size: f64,
    mechanical_shutter: c_int,
    st4_port: c_int,
    is_cooler_cam: c_int,
    is_usb3_host: c_int,
    is_usb3_camera: c_int,
    elec_per_adu: f32,
    bit_depth: c_int,
    is_trigger_cam: c_int,
    unused: [c_char; 16],
}

impl AsiCameraInfo {
    fn zeroed() -> Self {
        // SAFETY: plain C struct of integers, floats and char arrays; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn to_device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name(),
            camera_id: self.camera_id,
            max_width: u32::try_from(self.max_width).unwrap_or(0),
            max_height: u32::try_from(self.max_height).unwrap_or(0),
            is_color: self.is_color_cam == ASI_TRUE,
            bit_depth: u32::try_from(self.bit_depth).unwrap_or(0),
            pixel_size_um: self.pixel_size,
            usb3: self.is_usb3_host == ASI_TRUE,
        }
    }
}

// =============================================================================
// SDK LIBRARY LOADING
// =============================================================================

/// Resolved ASICamera2 entry points.
struct AsiSdk {
    // Keeps the function pointers below valid.
    _lib: Library,

    get_num_of_connected_cameras: unsafe extern "C" fn() -> c_int,
    get_camera_property: unsafe extern "C" fn(*mut AsiCameraInfo, c_int) -> c_int,
    open_camera: unsafe extern "C" fn(c_int) -> c_int,
    init_camera: unsafe extern "C" fn(c_int) -> c_int,
    close_camera: unsafe extern "C" fn(c_int) -> c_int,
    set_roi_format: unsafe extern "C" fn(c_int, c_int, c_int, c_int, c_int) -> c_int,
    set_control_value: unsafe extern "C" fn(c_int, c_int, c_long, c_int) -> c_int,
    start_video_capture: unsafe extern "C" fn(c_int) -> c_int,
    stop_video_capture: unsafe extern "C" fn(c_int) -> c_int,
    get_video_data: unsafe extern "C" fn(c_int, *mut u8, c_long, c_int) -> c_int,
    start_exposure: unsafe extern "C" fn(c_int, c_int) -> c_int,
    stop_exposure: unsafe extern "C" fn(c_int) -> c_int,
    get_exp_status: unsafe extern "C" fn(c_int, *mut c_int) -> c_int,
    get_data_after_exp: unsafe extern "C" fn(c_int, *mut u8, c_long) -> c_int,
}

/// Copy one function pointer out of `lib`.
///
/// # Safety
/// `T` must be the exact C signature of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, HwError> {
    lib.get::<T>(name).map(|s| *s).map_err(|e| {
        let printable = String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)).into_owned();
        HwError::LibraryUnavailable(format!("missing symbol {printable}: {e}"))
    })
}

impl AsiSdk {
    /// Load the first candidate that opens and exports every entry point.
    fn load(candidates: &[PathBuf]) -> Result<Self, HwError> {
        let mut failures = Vec::new();
        for path in candidates {
            match Self::load_from(path) {
                Ok(sdk) => {
                    tracing::info!(path = %path.display(), "Loaded ASICamera2 SDK");
                    return Ok(sdk);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "ASICamera2 candidate rejected");
                    failures.push(format!("{}: {e}", path.display()));
                }
            }
        }
        Err(HwError::LibraryUnavailable(if failures.is_empty() {
            "no library paths configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    fn load_from(path: &Path) -> Result<Self, HwError> {
        // SAFETY: loading runs the library's initialisers; the ASI SDK has no unsound ones.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| HwError::LibraryUnavailable(e.to_string()))?;

        // SAFETY: every signature below matches ASICamera2.h for SDK V1.x.
        unsafe {
            Ok(Self {
                get_num_of_connected_cameras: symbol(&lib, b"ASIGetNumOfConnectedCameras\0")?,
                get_camera_property: symbol(&lib, b"ASIGetCameraProperty\0")?,
                open_camera: symbol(&lib, b"ASIOpenCamera\0")?,
                init_camera: symbol(&lib, b"ASIInitCamera\0")?,
                close_camera: symbol(&lib, b"ASICloseCamera\0")?,
                set_roi_format: symbol(&lib, b"ASISetROIFormat\0")?,
                set_control_value: symbol(&lib, b"ASISetControlValue\0")?,
                start_video_capture: symbol(&lib, b"ASIStartVideoCapture\0")?,
                stop_video_capture: symbol(&lib, b"ASIStopVideoCapture\0")?,
                get_video_data: symbol(&lib, b"ASIGetVideoData\0")?,
                start_exposure: symbol(&lib, b"ASIStartExposure\0")?,
                stop_exposure: symbol(&lib, b"ASIStopExposure\0")?,
                get_exp_status: symbol(&lib, b"ASIGetExpStatus\0")?,
                get_data_after_exp: symbol(&lib, b"ASIGetDataAfterExp\0")?,
                _lib: lib,
            })
        }
    }
}

/// Default library locations for the running platform.
///
/// Used when the configuration has no entry for the current CPU architecture.
pub fn platform_library_candidates() -> Vec<PathBuf> {
    let names: &[&str] = if cfg!(target_os = "windows") {
        &["ASICamera2.dll"]
    } else if cfg!(target_os = "macos") {
        &["libASICamera2.dylib", "/usr/local/lib/libASICamera2.dylib"]
    } else {
        &[
            "libASICamera2.so",
            "/usr/lib/libASICamera2.so",
            "/usr/local/lib/libASICamera2.so",
        ]
    };
    names.iter().map(PathBuf::from).collect()
}

// =============================================================================
// CAMERA
// =============================================================================

/// ZWO ASI camera driven through the ASICamera2 SDK.
///
/// The SDK is loaded lazily on the first `open()` so the service can start (and report the
/// problem through `/status`) on a machine without the library.
pub struct AsiCamera {
    library_paths: Vec<PathBuf>,
    sdk: Option<AsiSdk>,
    camera_id: Option<c_int>,
    info: Option<DeviceInfo>,
    roi: (ImageFormat, u32, u32),
    streaming: bool,
    exposing: bool,
}

impl AsiCamera {
    /// Create a driver that will try `library_paths` in order.
    pub fn new(library_paths: Vec<PathBuf>) -> Self {
        Self {
            library_paths,
            sdk: None,
            camera_id: None,
            info: None,
            roi: (ImageFormat::Raw8, 0, 0),
            streaming: false,
            exposing: false,
        }
    }

    fn session(&self) -> Result<(&AsiSdk, c_int), HwError> {
        match (&self.sdk, self.camera_id) {
            (Some(sdk), Some(id)) => Ok((sdk, id)),
            _ => Err(HwError::NotOpen),
        }
    }

    fn read_frame(&self, operation: &'static str, timeout: Option<Duration>) -> Result<Frame, HwError> {
        let (sdk, id) = self.session()?;
        let (format, width, height) = self.roi;
        let len = Frame::expected_len(format, width, height);
        let mut buffer = vec![0u8; len];
        let size = c_long::try_from(len).map_err(|_| HwError::Sdk {
            operation,
            code: ASI_ERROR_INVALID_SIZE,
        })?;

        let code = match timeout {
            Some(timeout) => {
                let wait_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
                // SAFETY: buffer is writable for `size` bytes and outlives the call.
                unsafe { (sdk.get_video_data)(id, buffer.as_mut_ptr(), size, wait_ms) }
            }
            // SAFETY: as above.
            None => unsafe { (sdk.get_data_after_exp)(id, buffer.as_mut_ptr(), size) },
        };
        check(operation, code)?;

        if format == ImageFormat::Rgb24 {
            // SDK delivers B,G,R
            for px in buffer.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
        }
        Ok(Frame::new(format, width, height, buffer))
    }
}

impl HardwareHandle for AsiCamera {
    fn open(&mut self) -> Result<DeviceInfo, HwError> {
        if let (Some(_), Some(info)) = (self.camera_id, &self.info) {
            return Ok(info.clone());
        }
        if self.sdk.is_none() {
            self.sdk = Some(AsiSdk::load(&self.library_paths)?);
        }
        let sdk = self.sdk.as_ref().ok_or(HwError::NotOpen)?;

        // SAFETY: no arguments; SDK loaded.
        let count = unsafe { (sdk.get_num_of_connected_cameras)() };
        tracing::info!(count, "Enumerated ASI cameras");
        if count <= 0 {
            return Err(HwError::NoDeviceFound);
        }

        let mut raw = AsiCameraInfo::zeroed();
        // SAFETY: raw is a valid, writable ASI_CAMERA_INFO.
        let code = unsafe { (sdk.get_camera_property)(&mut raw, 0) };
        if code != ASI_SUCCESS {
            return Err(HwError::InitFailed(code));
        }
        let id = raw.camera_id;

        // SAFETY: id was returned by ASIGetCameraProperty.
        let code = unsafe { (sdk.open_camera)(id) };
        if code != ASI_SUCCESS {
            return Err(HwError::InitFailed(code));
        }
        // SAFETY: camera opened above.
        let code = unsafe { (sdk.init_camera)(id) };
        if code != ASI_SUCCESS {
            // SAFETY: release the handle we just opened.
            unsafe { (sdk.close_camera)(id) };
            return Err(HwError::InitFailed(code));
        }

        let info = raw.to_device_info();
        tracing::info!(
            camera = %info.name,
            width = info.max_width,
            height = info.max_height,
            color = info.is_color,
            usb3 = info.usb3,
            "ASI camera opened"
        );

        self.camera_id = Some(id);
        self.roi = (ImageFormat::Raw8, info.max_width, info.max_height);
        self.streaming = false;
        self.exposing = false;
        self.info = Some(info.clone());
        Ok(info)
    }

    fn configure_format(
        &mut self,
        format: ImageFormat,
        width: u32,
        height: u32,
    ) -> Result<(), HwError> {
        let (sdk, id) = self.session()?;
        let w = c_int::try_from(width).unwrap_or(c_int::MAX);
        let h = c_int::try_from(height).unwrap_or(c_int::MAX);
        // SAFETY: plain integer arguments on an open camera.
        let code = unsafe { (sdk.set_roi_format)(id, w, h, 1, img_type(format)) };
        match code {
            ASI_SUCCESS => {
                self.roi = (format, width, height);
                tracing::debug!(%format, width, height, "ROI format set");
                Ok(())
            }
            ASI_ERROR_CAMERA_CLOSED | ASI_ERROR_CAMERA_REMOVED => Err(HwError::Disconnected),
            code => Err(HwError::FormatUnsupported {
                format,
                width,
                height,
                code,
            }),
        }
    }

    fn set_control(&mut self, control: Control, value: i64, auto: bool) -> Result<(), HwError> {
        let (sdk, id) = self.session()?;
        let raw_value = c_long::try_from(value).unwrap_or(c_long::MAX);
        let auto_flag = if auto { ASI_TRUE } else { ASI_FALSE };
        // SAFETY: plain integer arguments on an open camera.
        let code = unsafe { (sdk.set_control_value)(id, control_type(control), raw_value, auto_flag) };
        match code {
            ASI_SUCCESS => Ok(()),
            ASI_ERROR_CAMERA_CLOSED | ASI_ERROR_CAMERA_REMOVED => Err(HwError::Disconnected),
            code => Err(HwError::ControlRejected { control, code }),
        }
    }

    fn start_video_capture(&mut self) -> Result<(), HwError> {
        if self.exposing {
            return Err(HwError::AlreadyExposing);
        }
        let (sdk, id) = self.session()?;
        // SAFETY: open camera, not exposing.
        check("ASIStartVideoCapture", unsafe { (sdk.start_video_capture)(id) })?;
        self.streaming = true;
        Ok(())
    }

    fn poll_video_frame(&mut self, timeout: Duration) -> Result<Frame, HwError> {
        if !self.streaming {
            return Err(HwError::Sdk {
                operation: "ASIGetVideoData",
                code: ASI_ERROR_INVALID_SEQUENCE,
            });
        }
        self.read_frame("ASIGetVideoData", Some(timeout))
    }

    fn stop_video_capture(&mut self) -> Result<(), HwError> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        let (sdk, id) = self.session()?;
        // SAFETY: open camera in video mode.
        check("ASIStopVideoCapture", unsafe { (sdk.stop_video_capture)(id) })
    }

    fn start_exposure(&mut self) -> Result<(), HwError> {
        if self.streaming {
            return Err(HwError::VideoModeActive);
        }
        let (sdk, id) = self.session()?;
        // SAFETY: open camera, video mode off; ASI_FALSE = light frame.
        check("ASIStartExposure", unsafe { (sdk.start_exposure)(id, ASI_FALSE) })?;
        self.exposing = true;
        Ok(())
    }

    fn poll_exposure_status(&mut self) -> Result<ExposureStatus, HwError> {
        let (sdk, id) = self.session()?;
        let mut raw: c_int = 0;
        // SAFETY: raw is a valid out pointer.
        check("ASIGetExpStatus", unsafe { (sdk.get_exp_status)(id, &mut raw) })?;
        let status = exposure_status(raw);
        self.exposing = status == ExposureStatus::InProgress;
        Ok(status)
    }

    fn fetch_exposed_frame(&mut self) -> Result<Frame, HwError> {
        let frame = self.read_frame("ASIGetDataAfterExp", None)?;
        self.exposing = false;
        Ok(frame)
    }

    fn abort_exposure(&mut self) -> Result<(), HwError> {
        let (sdk, id) = self.session()?;
        // SAFETY: open camera; stopping an idle camera is accepted by the SDK.
        let code = unsafe { (sdk.stop_exposure)(id) };
        self.exposing = false;
        check("ASIStopExposure", code)
    }

    fn close(&mut self) {
        if let Err(e) = self.stop_video_capture() {
            tracing::debug!(error = %e, "Stopping video during close failed");
        }
        if let (Some(sdk), Some(id)) = (&self.sdk, self.camera_id.take()) {
            // SAFETY: id is the camera we opened; closed exactly once thanks to take().
            let code = unsafe { (sdk.close_camera)(id) };
            if code != ASI_SUCCESS {
                tracing::warn!(code, name = error_name(code), "ASICloseCamera failed");
            } else {
                tracing::info!(camera_id = id, "ASI camera closed");
            }
        }
        self.info = None;
        self.streaming = false;
        self.exposing = false;
    }
}

impl Drop for AsiCamera {
    fn drop(&mut self) {
        self.close();
    }
}
