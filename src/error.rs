//! Custom error types for the camera service.
//!
//! Errors are layered the same way the service is:
//!
//! - **`HwError`**: raw outcomes of a single call on a [`HardwareHandle`]. Backends translate
//!   native return codes into these variants and nothing else.
//! - **`StateError`**: a rejected mode transition on the camera state machine.
//! - **`ValidationError`**: settings rejected before any hardware is touched.
//! - **`ServiceError`**: what the public operations return. It wraps the three above and adds
//!   the service-level conditions (not connected, sequence already running, storage failures).
//!
//! Every `ServiceError` belongs to exactly one [`ErrorClass`], which is what the HTTP layer
//! uses to choose a status code and what the engines use to decide between retrying and
//! tearing the session down.
//!
//! [`HardwareHandle`]: crate::hardware::HardwareHandle

use crate::camera::state::Mode;
use crate::hardware::asi::error_name;
use crate::hardware::{Control, ImageFormat};
use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results of the public camera operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Failure reported by a hardware backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// The vendor library could not be loaded or is missing a symbol.
    #[error("camera SDK unavailable: {0}")]
    LibraryUnavailable(String),

    /// Enumeration returned zero devices.
    #[error("no camera found")]
    NoDeviceFound,

    /// Open or init returned a non-success code.
    #[error("camera initialisation failed: {} ({0})", error_name(*.0))]
    InitFailed(i32),

    /// An operation was attempted before `open()` or after `close()`.
    #[error("camera is not open")]
    NotOpen,

    /// The sensor rejected the requested format / region of interest.
    #[error("format {format} at {width}x{height} rejected by camera: {} ({code})", error_name(*.code))]
    FormatUnsupported {
        /// Requested pixel format
        format: ImageFormat,
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Native return code
        code: i32,
    },

    /// A control write was refused.
    #[error("control {control} rejected by camera: {} ({code})", error_name(*.code))]
    ControlRejected {
        /// Control that was written
        control: Control,
        /// Native return code
        code: i32,
    },

    /// Video capture requested while an exposure is running.
    #[error("an exposure is in progress")]
    AlreadyExposing,

    /// Exposure requested while video capture is running.
    #[error("video capture is active")]
    VideoModeActive,

    /// No video frame arrived within the poll timeout.
    #[error("timed out waiting for a video frame")]
    Timeout,

    /// The device went away (unplugged, USB reset, handle closed underneath us).
    #[error("camera disconnected")]
    Disconnected,

    /// The exposure did not report success before its deadline.
    #[error("exposure did not complete within {waited_ms} ms")]
    ExposureTimeout {
        /// Time spent polling before giving up
        waited_ms: u64,
    },

    /// The camera reported a failed exposure.
    #[error("camera reported a failed exposure")]
    ExposureFailed,

    /// Any other non-success native return code.
    #[error("{operation} failed: {} ({code})", error_name(*.code))]
    Sdk {
        /// Native function that failed
        operation: &'static str,
        /// Native return code
        code: i32,
    },
}

impl HwError {
    /// Whether this failure invalidates the device session.
    ///
    /// Fatal errors mark the camera disconnected and require an explicit reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HwError::Disconnected
                | HwError::NotOpen
                | HwError::LibraryUnavailable(_)
                | HwError::NoDeviceFound
                | HwError::InitFailed(_)
        )
    }
}

/// A mode change the state machine does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// There is no edge from `from` to `to`.
    #[error("cannot switch camera from {from} to {to}")]
    InvalidTransition {
        /// Mode at the time of the request
        from: Mode,
        /// Requested mode
        to: Mode,
    },
}

/// Settings rejected before touching the hardware.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Numeric value outside its documented range.
    #[error("{field} = {value} is out of range ({min}..={max})")]
    OutOfRange {
        /// Field name as it appears in the request body
        field: &'static str,
        /// Rejected value
        value: i64,
        /// Inclusive lower bound
        min: i64,
        /// Inclusive upper bound
        max: i64,
    },

    /// Value that is not numeric-range shaped (unknown format name, negative interval, ...).
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Field name as it appears in the request body
        field: &'static str,
        /// Human readable reason
        reason: String,
    },
}

/// Error taxonomy shared by the engines and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or out-of-range input; nothing was changed.
    Validation,
    /// Retryable hardware condition; long-lived state is untouched.
    HardwareTransient,
    /// The device session is gone; reconnect required.
    HardwareFatal,
    /// The request conflicts with the current camera mode or a running job.
    StateConflict,
    /// Local failure unrelated to the camera (disk, encoder, worker panic).
    Internal,
}

impl ErrorClass {
    /// Stable identifier used in JSON error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::HardwareTransient => "hardware_transient",
            ErrorClass::HardwareFatal => "hardware_fatal",
            ErrorClass::StateConflict => "state_conflict",
            ErrorClass::Internal => "internal",
        }
    }
}

/// Error returned by the public camera operations.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Hardware call failed.
    #[error(transparent)]
    Hardware(#[from] HwError),

    /// Mode transition rejected.
    #[error(transparent)]
    State(#[from] StateError),

    /// Settings rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The operation needs an open camera.
    #[error("camera not connected")]
    NotConnected,

    /// A sequence job is active (or still winding down).
    #[error("a sequence capture is already running")]
    AlreadyRunning,

    /// The operation needs a running video stream.
    #[error("video stream is not running")]
    StreamNotRunning,

    /// Requested photo count below one.
    #[error("invalid photo count {0}: at least one photo is required")]
    InvalidCount(i64),

    /// Sequence file format not recognised.
    #[error("unsupported file format '{0}'")]
    UnsupportedFileFormat(String),

    /// Writing a frame to disk failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Converting a frame to an image failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A background worker panicked or was cancelled.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl ServiceError {
    /// Taxonomy member of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Hardware(e) if e.is_fatal() => ErrorClass::HardwareFatal,
            ServiceError::Hardware(_) => ErrorClass::HardwareTransient,
            ServiceError::NotConnected => ErrorClass::HardwareFatal,
            ServiceError::State(_)
            | ServiceError::AlreadyRunning
            | ServiceError::StreamNotRunning => ErrorClass::StateConflict,
            ServiceError::Validation(_)
            | ServiceError::InvalidCount(_)
            | ServiceError::UnsupportedFileFormat(_) => ErrorClass::Validation,
            ServiceError::Storage(_) | ServiceError::Encoding(_) | ServiceError::Worker(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether the device session was lost.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::HardwareFatal
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServiceError::Worker(err.to_string())
    }
}
