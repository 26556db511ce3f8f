//! Frame encoding.
//!
//! Converts [`Frame`] buffers into `image` crate types. Channel layout follows the frame
//! format: RGB24 becomes an RGB image, RAW8/Y8 8-bit luminance and RAW16 16-bit
//! luminance (little-endian samples). JPEG has no 16-bit mode, so RAW16 is reduced to
//! its high byte before JPEG encoding.

use crate::error::ServiceError;
use crate::hardware::{Frame, ImageFormat};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage};

/// Wrap the frame's pixels in a [`DynamicImage`].
///
/// # Errors
/// [`ServiceError::Encoding`] if the buffer does not match the frame geometry.
pub fn to_image(frame: &Frame) -> Result<DynamicImage, ServiceError> {
    if !frame.is_complete() {
        return Err(ServiceError::Encoding(format!(
            "frame data size mismatch: expected {} bytes for {}x{} {}, got {}",
            Frame::expected_len(frame.format, frame.width, frame.height),
            frame.width,
            frame.height,
            frame.format,
            frame.bytes.len()
        )));
    }

    let mismatch = || ServiceError::Encoding("failed to create image buffer from frame data".into());
    let image = match frame.format {
        ImageFormat::Rgb24 => {
            let img: RgbImage = ImageBuffer::from_raw(frame.width, frame.height, frame.bytes.clone())
                .ok_or_else(mismatch)?;
            DynamicImage::ImageRgb8(img)
        }
        ImageFormat::Raw8 | ImageFormat::Y8 => {
            let img: GrayImage = ImageBuffer::from_raw(frame.width, frame.height, frame.bytes.clone())
                .ok_or_else(mismatch)?;
            DynamicImage::ImageLuma8(img)
        }
        ImageFormat::Raw16 => {
            let samples: Vec<u16> = frame
                .bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(frame.width, frame.height, samples).ok_or_else(mismatch)?;
            DynamicImage::ImageLuma16(img)
        }
    };
    Ok(image)
}

/// Encode `frame` as JPEG at `quality` (1-100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, ServiceError> {
    let image = match to_image(frame)? {
        DynamicImage::ImageLuma16(_) => {
            // 16 → 8 bit, keeping the most significant byte
            let narrowed: GrayImage = ImageBuffer::from_fn(frame.width, frame.height, |x, y| {
                let idx = (y as usize * frame.width as usize + x as usize) * 2;
                Luma([frame.bytes[idx + 1]])
            });
            DynamicImage::ImageLuma8(narrowed)
        }
        other => other,
    };

    let mut out = Vec::new();
    image
        .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)))
        .map_err(|e| ServiceError::Encoding(format!("JPEG encoding failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_frame_keeps_channel_order() {
        let frame = Frame::new(ImageFormat::Rgb24, 2, 1, vec![10, 20, 30, 40, 50, 60]);
        let img = to_image(&frame).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [10, 20, 30]);
        assert_eq!(img.get_pixel(1, 0).0, [40, 50, 60]);
    }

    #[test]
    fn raw16_samples_are_little_endian() {
        let frame = Frame::new(ImageFormat::Raw16, 1, 1, vec![0x34, 0x12]);
        match to_image(&frame).unwrap() {
            DynamicImage::ImageLuma16(img) => assert_eq!(img.get_pixel(0, 0).0, [0x1234]),
            other => panic!("unexpected image {:?}", other.color()),
        }
    }

    #[test]
    fn jpeg_output_has_soi_marker() {
        for format in [ImageFormat::Rgb24, ImageFormat::Raw8, ImageFormat::Raw16] {
            let len = Frame::expected_len(format, 16, 8);
            let frame = Frame::new(format, 16, 8, vec![128; len]);
            let jpeg = encode_jpeg(&frame, 85).unwrap();
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8], "{format}");
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = Frame::new(ImageFormat::Rgb24, 4, 4, vec![0; 10]);
        assert!(matches!(encode_jpeg(&frame, 75), Err(ServiceError::Encoding(_))));
    }
}
