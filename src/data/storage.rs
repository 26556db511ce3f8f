//! Sequence file output.
//!
//! One file per captured frame, named `<UTC yyyymmdd_HHMMSS>_<index:04>.<ext>` after the
//! frame's capture time and its 1-based position in the sequence, with `_N` appended when
//! that name is already taken. Bit depth is kept for
//! PNG and TIFF (RAW16 stays 16-bit); JPEG narrows 16-bit data to 8 bits; `raw` writes
//! the pixel buffer untouched.

use crate::data::encoding::{encode_jpeg, to_image};
use crate::error::{ServiceError, ServiceResult};
use crate::hardware::Frame;
use serde::Serialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const MAX_NAME_ATTEMPTS: u32 = 1000;

/// On-disk format of sequence frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Lossless PNG
    Png,
    /// JPEG
    Jpeg,
    /// Uncompressed TIFF
    Tiff,
    /// Pixel buffer as delivered by the camera
    Raw,
}

impl FileFormat {
    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Png => "png",
            FileFormat::Jpeg => "jpg",
            FileFormat::Tiff => "tif",
            FileFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for FileFormat {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => Ok(FileFormat::Png),
            "jpg" | "jpeg" => Ok(FileFormat::Jpeg),
            "tif" | "tiff" => Ok(FileFormat::Tiff),
            "raw" => Ok(FileFormat::Raw),
            _ => Err(ServiceError::UnsupportedFileFormat(s.to_string())),
        }
    }
}

/// Writes sequence frames into one directory.
#[derive(Debug, Clone)]
pub struct FrameWriter {
    dir: PathBuf,
    format: FileFormat,
    jpeg_quality: u8,
}

impl FrameWriter {
    /// Writer for `dir`, creating the directory if it does not exist.
    ///
    /// # Errors
    /// [`ServiceError::Storage`] if the directory cannot be created.
    pub fn create(dir: impl AsRef<Path>, format: FileFormat, jpeg_quality: u8) -> ServiceResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            ServiceError::Storage(format!("cannot create {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            format,
            jpeg_quality,
        })
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the frame with `index` will be written to.
    pub fn path_for(&self, frame: &Frame, index: u32) -> PathBuf {
        self.candidate(frame, index, 0)
    }

    fn candidate(&self, frame: &Frame, index: u32, attempt: u32) -> PathBuf {
        let stamp = frame.captured_at.format("%Y%m%d_%H%M%S");
        let ext = self.format.extension();
        if attempt == 0 {
            self.dir.join(format!("{stamp}_{index:04}.{ext}"))
        } else {
            self.dir.join(format!("{stamp}_{index:04}_{attempt}.{ext}"))
        }
    }

    /// Create a file that did not exist before. Taken names get a `_N` suffix.
    fn create_unique(&self, frame: &Frame, index: u32, bytes: &[u8]) -> ServiceResult<PathBuf> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = self.candidate(frame, index, attempt);
            let file = OpenOptions::new().write(true).create_new(true).open(&path);
            match file {
                Ok(mut file) => {
                    file.write_all(bytes).map_err(|e| {
                        ServiceError::Storage(format!("failed to write {}: {e}", path.display()))
                    })?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ServiceError::Storage(format!(
                        "failed to create {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        Err(ServiceError::Storage(format!(
            "no free file name for frame {index} in {}",
            self.dir.display()
        )))
    }

    /// Encode and write one frame. Blocking; call from the blocking pool.
    /// An existing file is never overwritten.
    pub fn write(&self, frame: &Frame, index: u32) -> ServiceResult<PathBuf> {
        let bytes = match self.format {
            FileFormat::Raw => frame.bytes.clone(),
            FileFormat::Jpeg => encode_jpeg(frame, self.jpeg_quality)?,
            FileFormat::Png => encode_with(frame, image::ImageFormat::Png)?,
            FileFormat::Tiff => encode_with(frame, image::ImageFormat::Tiff)?,
        };
        let path = self.create_unique(frame, index, &bytes)?;

        tracing::debug!(
            path = %path.display(),
            dimensions = format!("{}x{}", frame.width, frame.height),
            format = %self.format,
            bytes = bytes.len(),
            "Wrote sequence frame"
        );
        Ok(path)
    }
}

fn encode_with(frame: &Frame, format: image::ImageFormat) -> ServiceResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    to_image(frame)?
        .write_to(&mut out, format)
        .map_err(|e| ServiceError::Encoding(format!("{format:?} encoding failed: {e}")))?;
    Ok(out.into_inner())
}
