//! Settings Applier
//!
//! Validates a partial settings update as a whole, then decides how it reaches the
//! camera:
//!
//! | Mode / connection     | Effect                                                  |
//! |-----------------------|---------------------------------------------------------|
//! | streaming             | stop loop → store → clear frame → restart loop          |
//! | idle, connected       | write controls through the gate, then store             |
//! | exposing / offline    | store only; used by the next exposure, stream or connect |
//!
//! Nothing is stored or written when any field fails validation.

use crate::camera::state::{CameraSettings, CameraStateStore, Mode};
use crate::camera::stream::StreamEngine;
use crate::error::{HwError, ServiceResult, ValidationError};
use crate::hardware::{Control, HardwareHandle, ImageFormat};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Gain range.
pub const GAIN_RANGE: RangeInclusive<i64> = 0..=100;
/// Single-exposure time range (µs).
pub const EXPOSURE_PHOTO_RANGE: RangeInclusive<i64> = 1_000..=10_000_000;
/// Video auto-exposure ceiling range (µs).
pub const EXPOSURE_VIDEO_RANGE: RangeInclusive<i64> = 1_000..=1_000_000;
/// Gamma range.
pub const GAMMA_RANGE: RangeInclusive<i64> = 1..=100;
/// White-balance range for both channels.
pub const WB_RANGE: RangeInclusive<i64> = 1..=99;

/// Partial settings update, as posted to `/camera/settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsChanges {
    /// Gain, 0-100
    pub gain: Option<i64>,
    /// Photo exposure (µs)
    pub photo_exposure: Option<i64>,
    /// Video exposure ceiling (µs)
    pub video_exposure: Option<i64>,
    /// `RGB24`, `RAW8`, `RAW16` or `Y8`
    pub image_format: Option<String>,
    /// Gamma, 1-100
    pub gamma: Option<i64>,
    /// Red white balance, 1-99
    pub wb_r: Option<i64>,
    /// Blue white balance, 1-99
    pub wb_b: Option<i64>,
    /// Auto white balance
    pub wb_auto: Option<bool>,
}

fn checked(
    field: &'static str,
    value: i64,
    range: &RangeInclusive<i64>,
) -> Result<i64, ValidationError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

// Ranges above are non-negative, so these conversions cannot fail after `checked`.
fn as_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn as_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl SettingsChanges {
    /// Whether no field is present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Validate every present field and produce the merged settings.
    ///
    /// Returns the first failure; `current` is never modified.
    pub fn merge_into(&self, current: &CameraSettings) -> Result<CameraSettings, ValidationError> {
        let mut next = current.clone();
        if let Some(v) = self.gain {
            next.gain = as_u32(checked("gain", v, &GAIN_RANGE)?);
        }
        if let Some(v) = self.photo_exposure {
            next.photo_exposure_us = as_u64(checked("photo_exposure", v, &EXPOSURE_PHOTO_RANGE)?);
        }
        if let Some(v) = self.video_exposure {
            next.video_exposure_us = as_u64(checked("video_exposure", v, &EXPOSURE_VIDEO_RANGE)?);
        }
        if let Some(name) = &self.image_format {
            next.image_format = name
                .parse::<ImageFormat>()
                .map_err(|reason| ValidationError::InvalidValue {
                    field: "image_format",
                    reason,
                })?;
        }
        if let Some(v) = self.gamma {
            next.gamma = as_u32(checked("gamma", v, &GAMMA_RANGE)?);
        }
        if let Some(v) = self.wb_r {
            next.wb_r = as_u32(checked("wb_r", v, &WB_RANGE)?);
        }
        if let Some(v) = self.wb_b {
            next.wb_b = as_u32(checked("wb_b", v, &WB_RANGE)?);
        }
        if let Some(v) = self.wb_auto {
            next.wb_auto = v;
        }
        Ok(next)
    }
}

/// Result of a settings update.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedSettings {
    /// Settings now stored
    pub settings: CameraSettings,
    /// The stream was stopped and started to pick the change up
    pub restarted_stream: bool,
    /// Controls were written to the camera
    pub applied_to_hardware: bool,
}

/// Write gain, gamma and white balance. Runs under the gate.
pub(crate) fn write_image_controls(
    hw: &mut dyn HardwareHandle,
    settings: &CameraSettings,
) -> Result<(), HwError> {
    hw.set_control(Control::Gain, settings.gain.into(), false)?;
    hw.set_control(Control::Gamma, settings.gamma.into(), false)?;
    hw.set_control(Control::WbR, settings.wb_r.into(), settings.wb_auto)?;
    hw.set_control(Control::WbB, settings.wb_b.into(), settings.wb_auto)
}

/// Applies validated settings changes.
pub struct SettingsApplier {
    store: Arc<CameraStateStore>,
    stream: Arc<StreamEngine>,
}

impl SettingsApplier {
    /// Applier that restarts `stream` when needed.
    pub fn new(store: Arc<CameraStateStore>, stream: Arc<StreamEngine>) -> Self {
        Self { store, stream }
    }

    /// Validate and apply `changes`.
    ///
    /// # Errors
    /// - [`ServiceError::Validation`](crate::error::ServiceError::Validation): nothing changed
    /// - hardware errors from the direct write or the stream restart
    pub async fn apply(&self, changes: SettingsChanges) -> ServiceResult<AppliedSettings> {
        // Held to the end: concurrent applies and stream start/stop wait here.
        let mut engine = self.stream.lock().await;
        let current = self.store.settings();
        let next = changes.merge_into(&current)?;

        if next == current {
            return Ok(AppliedSettings {
                settings: next,
                restarted_stream: false,
                applied_to_hardware: false,
            });
        }

        let state = self.store.snapshot();
        let (restarted_stream, applied_to_hardware) = match state.mode {
            Mode::Streaming => {
                let store = Arc::clone(&self.store);
                let stored = next.clone();
                let restarted = engine
                    .restart_with(move || store.commit_settings(stored))
                    .await?;
                (restarted, restarted)
            }
            Mode::Idle if state.connected => {
                let to_write = next.clone();
                let written = self
                    .store
                    .run_hardware(move |hw| write_image_controls(hw, &to_write))
                    .await?;
                if let Err(e) = written {
                    self.store.record_hw_error(&e);
                    return Err(e.into());
                }
                self.store.commit_settings(next.clone());
                (false, true)
            }
            _ => {
                self.store.commit_settings(next.clone());
                (false, false)
            }
        };

        tracing::info!(
            gain = next.gain,
            photo_exposure_us = next.photo_exposure_us,
            video_exposure_us = next.video_exposure_us,
            image_format = %next.image_format,
            restarted_stream,
            applied_to_hardware,
            "Camera settings updated"
        );
        Ok(AppliedSettings {
            settings: next,
            restarted_stream,
            applied_to_hardware,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_range_boundaries() {
        let changes = SettingsChanges {
            gain: Some(100),
            photo_exposure: Some(1_000),
            video_exposure: Some(1_000_000),
            gamma: Some(1),
            wb_r: Some(99),
            wb_b: Some(1),
            ..SettingsChanges::default()
        };
        let next = changes.merge_into(&CameraSettings::default()).unwrap();
        assert_eq!(next.gain, 100);
        assert_eq!(next.photo_exposure_us, 1_000);
        assert_eq!(next.video_exposure_us, 1_000_000);
        assert_eq!((next.gamma, next.wb_r, next.wb_b), (1, 99, 1));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let base = CameraSettings::default();
        let cases = [
            (SettingsChanges { gain: Some(150), ..Default::default() }, "gain"),
            (SettingsChanges { gain: Some(-1), ..Default::default() }, "gain"),
            (SettingsChanges { photo_exposure: Some(999), ..Default::default() }, "photo_exposure"),
            (SettingsChanges { video_exposure: Some(2_000_000), ..Default::default() }, "video_exposure"),
            (SettingsChanges { gamma: Some(0), ..Default::default() }, "gamma"),
            (SettingsChanges { wb_b: Some(100), ..Default::default() }, "wb_b"),
        ];
        for (changes, expected) in cases {
            match changes.merge_into(&base) {
                Err(ValidationError::OutOfRange { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn one_bad_field_rejects_the_whole_update() {
        let changes = SettingsChanges {
            gain: Some(70),
            photo_exposure: Some(20_000_000),
            ..SettingsChanges::default()
        };
        assert_eq!(
            changes.merge_into(&CameraSettings::default()),
            Err(ValidationError::OutOfRange {
                field: "photo_exposure",
                value: 20_000_000,
                min: 1_000,
                max: 10_000_000
            })
        );
    }

    #[test]
    fn parses_image_format_names() {
        let next = SettingsChanges {
            image_format: Some("raw16".into()),
            ..SettingsChanges::default()
        }
        .merge_into(&CameraSettings::default())
        .unwrap();
        assert_eq!(next.image_format, ImageFormat::Raw16);

        let bad = SettingsChanges {
            image_format: Some("RAW12".into()),
            ..SettingsChanges::default()
        };
        assert!(matches!(
            bad.merge_into(&CameraSettings::default()),
            Err(ValidationError::InvalidValue { field: "image_format", .. })
        ));
    }

    #[test]
    fn deserializes_partial_body() {
        let changes: SettingsChanges =
            serde_json::from_str(r#"{"gain": 70, "wb_auto": true}"#).unwrap();
        assert_eq!(changes.gain, Some(70));
        assert_eq!(changes.wb_auto, Some(true));
        assert!(changes.photo_exposure.is_none());
        assert!(!changes.is_empty());
        assert!(SettingsChanges::default().is_empty());
    }
}
