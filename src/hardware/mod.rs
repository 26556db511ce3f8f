//! Camera Hardware Abstraction
//!
//! Everything that talks to a physical (or simulated) sensor lives under this module.
//! The rest of the service only ever sees the [`HardwareHandle`] capability trait and the
//! plain value types defined here.
//!
//! - [`asi`]: ZWO ASICamera2 SDK backend, loaded at runtime with `libloading`
//! - [`mock`]: in-process simulated camera with fault injection
//!
//! # Pixel layout
//!
//! | Format  | Bytes per pixel | Layout                     |
//! |---------|-----------------|----------------------------|
//! | `RGB24` | 3               | R, G, B (interleaved)      |
//! | `RAW8`  | 1               | Bayer / mono, 8 bit        |
//! | `RAW16` | 2               | Bayer / mono, little endian|
//! | `Y8`    | 1               | Luminance                  |

pub mod asi;
pub mod handle;
pub mod mock;

pub use handle::HardwareHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel encoding requested from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageFormat {
    /// 8-bit colour, three channels
    #[default]
    #[serde(rename = "RGB24")]
    Rgb24,
    /// 8-bit raw sensor data
    #[serde(rename = "RAW8")]
    Raw8,
    /// 16-bit raw sensor data
    #[serde(rename = "RAW16")]
    Raw16,
    /// 8-bit luminance
    #[serde(rename = "Y8")]
    Y8,
}

impl ImageFormat {
    /// Bytes used by one pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            ImageFormat::Rgb24 => 3,
            ImageFormat::Raw16 => 2,
            ImageFormat::Raw8 | ImageFormat::Y8 => 1,
        }
    }

    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Rgb24 => "RGB24",
            ImageFormat::Raw8 => "RAW8",
            ImageFormat::Raw16 => "RAW16",
            ImageFormat::Y8 => "Y8",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RGB24" => Ok(ImageFormat::Rgb24),
            "RAW8" => Ok(ImageFormat::Raw8),
            "RAW16" => Ok(ImageFormat::Raw16),
            "Y8" => Ok(ImageFormat::Y8),
            other => Err(format!(
                "unknown image format '{other}' (expected RGB24, RAW8, RAW16 or Y8)"
            )),
        }
    }
}

/// Sensor controls the service writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// Analogue gain
    Gain,
    /// Exposure time in microseconds
    Exposure,
    /// Gamma
    Gamma,
    /// White balance, red channel
    WbR,
    /// White balance, blue channel
    WbB,
    /// USB bandwidth share (percent)
    BandwidthOverload,
    /// Upper bound for auto-exposure in video mode (microseconds)
    AutoMaxExposure,
}

impl Control {
    /// Short name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Gain => "gain",
            Control::Exposure => "exposure",
            Control::Gamma => "gamma",
            Control::WbR => "wb_r",
            Control::WbB => "wb_b",
            Control::BandwidthOverload => "bandwidth",
            Control::AutoMaxExposure => "auto_max_exposure",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of an opened camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model name reported by the SDK
    pub name: String,
    /// SDK camera id
    pub camera_id: i32,
    /// Full sensor width in pixels
    pub max_width: u32,
    /// Full sensor height in pixels
    pub max_height: u32,
    /// Whether the sensor has a colour filter array
    pub is_color: bool,
    /// ADC bit depth
    pub bit_depth: u32,
    /// Pixel pitch in micrometres
    pub pixel_size_um: f64,
    /// Whether the camera is running on a USB3 link
    pub usb3: bool,
}

/// Progress of a single exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureStatus {
    /// No exposure has been started (or the last one was collected)
    Idle,
    /// Light collection or readout still running
    InProgress,
    /// Frame is ready to be fetched
    Success,
    /// The camera aborted the exposure
    Failed,
}

/// One acquired image.
///
/// Frames are immutable once built; the stream buffer shares them behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Pixel data, layout given by `format`
    pub bytes: Vec<u8>,
    /// Time the frame was handed over by the backend
    pub captured_at: DateTime<Utc>,
    /// Pixel format of `bytes`
    pub format: ImageFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Frame {
    /// Wrap a pixel buffer, stamping it with the current time.
    pub fn new(format: ImageFormat, width: u32, height: u32, bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            captured_at: Utc::now(),
            format,
            width,
            height,
        }
    }

    /// Buffer size for the given geometry.
    pub fn expected_len(format: ImageFormat, width: u32, height: u32) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    /// Whether `bytes` holds exactly one full image.
    pub fn is_complete(&self) -> bool {
        self.bytes.len() == Self::expected_len(self.format, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_image_formats_case_insensitively() {
        assert_eq!("rgb24".parse::<ImageFormat>(), Ok(ImageFormat::Rgb24));
        assert_eq!("Raw16".parse::<ImageFormat>(), Ok(ImageFormat::Raw16));
        assert_eq!("Y8".parse::<ImageFormat>(), Ok(ImageFormat::Y8));
        assert!("RAW12".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn image_format_serializes_with_sdk_names() {
        let json = serde_json::to_string(&ImageFormat::Raw16).unwrap();
        assert_eq!(json, "\"RAW16\"");
        let back: ImageFormat = serde_json::from_str("\"RGB24\"").unwrap();
        assert_eq!(back, ImageFormat::Rgb24);
    }

    #[test]
    fn frame_size_follows_format() {
        let frame = Frame::new(ImageFormat::Raw16, 4, 2, vec![0; 16]);
        assert!(frame.is_complete());
        assert_eq!(Frame::expected_len(ImageFormat::Rgb24, 4, 2), 24);

        let short = Frame::new(ImageFormat::Rgb24, 4, 2, vec![0; 10]);
        assert!(!short.is_complete());
    }
}
