//! Service Configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. built-in defaults ([`ServiceConfig::default`])
//! 2. a TOML file (`config/asicam.toml` unless `--config` says otherwise)
//! 3. environment variables prefixed `ASICAM_`, nested with `__`
//!    (e.g. `ASICAM_SERVER__PORT=9090`, `ASICAM_CAMERA__BACKEND=mock`)
//!
//! # Example
//! ```no_run
//! use asicam::config::ServiceConfig;
//!
//! let config = ServiceConfig::load_from("config/asicam.toml")?;
//! config.validate()?;
//! println!("listening on {}:{}", config.server.bind, config.server.port);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::camera::state::CameraSettings;
use crate::camera::settings::{
    EXPOSURE_PHOTO_RANGE, EXPOSURE_VIDEO_RANGE, GAIN_RANGE, GAMMA_RANGE, WB_RANGE,
};
use crate::hardware::asi::platform_library_candidates;
use crate::hardware::ImageFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/asicam.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listener
    pub server: ServerConfig,
    /// Camera backend and initial settings
    pub camera: CameraConfig,
    /// Streaming / MJPEG parameters
    pub stream: StreamConfig,
    /// Single-exposure protocol timing
    pub exposure: ExposureConfig,
    /// `/camera/snapshot` behaviour
    pub snapshot: SnapshotConfig,
    /// Log output
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub bind: String,
    /// TCP port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Which [`HardwareHandle`](crate::hardware::HardwareHandle) implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// ZWO ASICamera2 SDK
    #[default]
    Asi,
    /// In-process simulator
    Mock,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Hardware backend
    pub backend: Backend,
    /// Candidate SDK library paths keyed by CPU architecture (`x86_64`, `aarch64`, ...).
    /// A `default` entry applies to architectures without their own list.
    pub library_paths: BTreeMap<String, Vec<PathBuf>>,
    /// USB bandwidth share in percent (40-100)
    pub usb_bandwidth: u32,
    /// Initial gain
    pub gain: u32,
    /// Initial single-exposure time (µs)
    pub photo_exposure_us: u64,
    /// Initial video auto-exposure ceiling (µs)
    pub video_exposure_us: u64,
    /// Initial exposure image format
    pub image_format: ImageFormat,
    /// Initial gamma
    pub gamma: u32,
    /// Initial red white balance
    pub wb_r: u32,
    /// Initial blue white balance
    pub wb_b: u32,
    /// Initial auto white balance
    pub wb_auto: bool,
    /// Try to open the camera when the service starts
    pub connect_on_startup: bool,
    /// Simulated sensor size for the mock backend
    pub mock_width: u32,
    /// Simulated sensor size for the mock backend
    pub mock_height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let settings = CameraSettings::default();
        Self {
            backend: Backend::Asi,
            library_paths: BTreeMap::new(),
            usb_bandwidth: 40,
            gain: settings.gain,
            photo_exposure_us: settings.photo_exposure_us,
            video_exposure_us: settings.video_exposure_us,
            image_format: settings.image_format,
            gamma: settings.gamma,
            wb_r: settings.wb_r,
            wb_b: settings.wb_b,
            wb_auto: settings.wb_auto,
            connect_on_startup: true,
            mock_width: 1280,
            mock_height: 960,
        }
    }
}

impl CameraConfig {
    /// Settings the camera state store starts with.
    pub fn initial_settings(&self) -> CameraSettings {
        CameraSettings {
            gain: self.gain,
            photo_exposure_us: self.photo_exposure_us,
            video_exposure_us: self.video_exposure_us,
            image_format: self.image_format,
            gamma: self.gamma,
            wb_r: self.wb_r,
            wb_b: self.wb_b,
            wb_auto: self.wb_auto,
        }
    }

    /// SDK library candidates for the running CPU architecture.
    ///
    /// Falls back to the `default` entry, then to the platform's usual locations.
    pub fn library_candidates(&self) -> Vec<PathBuf> {
        self.library_paths
            .get(std::env::consts::ARCH)
            .or_else(|| self.library_paths.get("default"))
            .cloned()
            .unwrap_or_else(platform_library_candidates)
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Lower bound for the video poll timeout (ms)
    pub poll_timeout_ms: u64,
    /// Upper bound for the video poll timeout (ms)
    pub max_poll_timeout_ms: u64,
    /// Consecutive failed polls before the loop gives up
    pub max_consecutive_timeouts: u32,
    /// JPEG quality of MJPEG parts
    pub mjpeg_quality: u8,
    /// Cadence of MJPEG parts (ms)
    pub mjpeg_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 2000,
            max_poll_timeout_ms: 5000,
            max_consecutive_timeouts: 5,
            mjpeg_quality: 75,
            mjpeg_interval_ms: 100,
        }
    }
}

impl StreamConfig {
    /// Poll timeout for a given video exposure: twice the exposure plus 500 ms,
    /// clamped to the configured bounds.
    pub fn video_poll_timeout(&self, video_exposure_us: u64) -> Duration {
        let suggested = (video_exposure_us / 1000).saturating_mul(2).saturating_add(500);
        let upper = self.max_poll_timeout_ms.max(self.poll_timeout_ms);
        Duration::from_millis(suggested.clamp(self.poll_timeout_ms, upper))
    }
}

/// Single-exposure protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Status poll period (ms)
    pub poll_interval_ms: u64,
    /// Time allowed beyond the exposure itself (ms)
    pub grace_ms: u64,
    /// How long to wait for a leftover exposure before aborting it (ms)
    pub stuck_wait_ms: u64,
    /// Pause after an abort (ms)
    pub abort_settle_ms: u64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            grace_ms: 5000,
            stuck_wait_ms: 10_000,
            abort_settle_ms: 500,
        }
    }
}

impl ExposureConfig {
    /// Status poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Overall deadline for an exposure of `exposure_us`.
    pub fn deadline(&self, exposure_us: u64) -> Duration {
        Duration::from_micros(exposure_us) + Duration::from_millis(self.grace_ms)
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// JPEG quality of snapshots
    pub jpeg_quality: u8,
    /// Pause around stopping and resuming the stream (ms)
    pub settle_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            settle_ms: 500,
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load from the default path and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The provider stack, exposed for tests.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ServiceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ASICAM_").split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for (name, quality) in [
            ("stream.mjpeg_quality", self.stream.mjpeg_quality),
            ("snapshot.jpeg_quality", self.snapshot.jpeg_quality),
        ] {
            if quality == 0 || quality > 100 {
                return Err(format!("Invalid {name} {quality}. Must be 1-100"));
            }
        }

        let cam = &self.camera;
        check_range("camera.usb_bandwidth", cam.usb_bandwidth.into(), &(40..=100))?;
        check_range("camera.gain", cam.gain.into(), &GAIN_RANGE)?;
        check_range(
            "camera.photo_exposure_us",
            i64::try_from(cam.photo_exposure_us).unwrap_or(i64::MAX),
            &EXPOSURE_PHOTO_RANGE,
        )?;
        check_range(
            "camera.video_exposure_us",
            i64::try_from(cam.video_exposure_us).unwrap_or(i64::MAX),
            &EXPOSURE_VIDEO_RANGE,
        )?;
        check_range("camera.gamma", cam.gamma.into(), &GAMMA_RANGE)?;
        check_range("camera.wb_r", cam.wb_r.into(), &WB_RANGE)?;
        check_range("camera.wb_b", cam.wb_b.into(), &WB_RANGE)?;

        if self.stream.max_poll_timeout_ms < self.stream.poll_timeout_ms {
            return Err(format!(
                "stream.max_poll_timeout_ms ({}) is below stream.poll_timeout_ms ({})",
                self.stream.max_poll_timeout_ms, self.stream.poll_timeout_ms
            ));
        }
        if self.stream.max_consecutive_timeouts == 0 {
            return Err("stream.max_consecutive_timeouts must be at least 1".to_string());
        }
        if self.exposure.poll_interval_ms == 0 {
            return Err("exposure.poll_interval_ms must be at least 1".to_string());
        }

        Ok(())
    }
}

fn check_range(name: &str, value: i64, range: &RangeInclusive<i64>) -> Result<(), String> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(format!(
            "Invalid {name} {value}. Must be {}-{}",
            range.start(),
            range.end()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.camera.initial_settings(), CameraSettings::default());
    }

    #[test]
    fn toml_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "asicam.toml",
                r#"
                [camera]
                backend = "mock"
                gain = 20

                [camera.library_paths]
                default = ["/opt/asi/libASICamera2.so"]

                [stream]
                mjpeg_quality = 60
                "#,
            )?;
            jail.set_env("ASICAM_SERVER__PORT", "9090");
            jail.set_env("ASICAM_CAMERA__GAIN", "30");

            let config = ServiceConfig::load_from("asicam.toml")?;
            assert_eq!(config.camera.backend, Backend::Mock);
            assert_eq!(config.camera.gain, 30);
            assert_eq!(config.stream.mjpeg_quality, 60);
            assert_eq!(config.server.port, 9090);
            assert_eq!(config.exposure.grace_ms, 5000);
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_| {
            let config = ServiceConfig::load_from("does-not-exist.toml")?;
            assert_eq!(config.camera.usb_bandwidth, 40);
            Ok(())
        });
    }

    #[test]
    fn library_candidates_prefer_current_arch() {
        let mut camera = CameraConfig::default();
        camera
            .library_paths
            .insert("default".into(), vec![PathBuf::from("/fallback.so")]);
        assert_eq!(camera.library_candidates(), vec![PathBuf::from("/fallback.so")]);

        camera.library_paths.insert(
            std::env::consts::ARCH.into(),
            vec![PathBuf::from("/arch.so")],
        );
        assert_eq!(camera.library_candidates(), vec![PathBuf::from("/arch.so")]);
    }

    #[test]
    fn video_poll_timeout_is_clamped() {
        let stream = StreamConfig::default();
        assert_eq!(stream.video_poll_timeout(100_000), Duration::from_millis(2000));
        assert_eq!(stream.video_poll_timeout(1_000_000), Duration::from_millis(2500));
        assert_eq!(stream.video_poll_timeout(10_000_000), Duration::from_millis(5000));
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = ServiceConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.camera.gain = 150;
        assert!(config.validate().unwrap_err().contains("camera.gain"));

        let mut config = ServiceConfig::default();
        config.stream.max_poll_timeout_ms = 100;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.snapshot.jpeg_quality = 0;
        assert!(config.validate().is_err());
    }
}
