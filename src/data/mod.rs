//! Frame encoding and persistence.
//!
//! - [`encoding`]: frame → `image` buffers, JPEG for the HTTP surface
//! - [`storage`]: [`FrameWriter`](storage::FrameWriter) for sequence captures

pub mod encoding;
pub mod storage;

pub use encoding::encode_jpeg;
pub use storage::{FileFormat, FrameWriter};
