//! MJPEG preview body.
//!
//! `multipart/x-mixed-replace` stream: every `mjpeg_interval_ms` the newest frame in the
//! slot is sent as one JPEG part. A frame is encoded once and reused until a newer one is
//! published. The body ends when the stream engine stops.

use crate::camera::CameraService;
use crate::data::encoding::encode_jpeg;
use crate::hardware::Frame;
use axum::body::Body;
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Multipart boundary.
pub const BOUNDARY: &str = "frame";

/// `Content-Type` of the preview response.
pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

struct MjpegState {
    service: Arc<CameraService>,
    ticker: Interval,
    quality: u8,
    cached: Option<(Arc<Frame>, Bytes)>,
}

/// Wrap a JPEG in a multipart part.
pub fn part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(jpeg.len() + 96);
    buf.put_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

async fn next_part(mut st: MjpegState) -> Option<(Result<Bytes, Infallible>, MjpegState)> {
    loop {
        st.ticker.tick().await;
        if !st.service.stream().is_running().await {
            tracing::debug!("MJPEG client detached, stream stopped");
            return None;
        }
        let Some(frame) = st.service.stream().slot().latest() else {
            continue;
        };

        let jpeg = match &st.cached {
            Some((cached, bytes)) if Arc::ptr_eq(cached, &frame) => bytes.clone(),
            _ => {
                let quality = st.quality;
                let source = Arc::clone(&frame);
                let encoded =
                    tokio::task::spawn_blocking(move || encode_jpeg(&source, quality)).await;
                match encoded {
                    Ok(Ok(jpeg)) => {
                        let bytes = Bytes::from(jpeg);
                        st.cached = Some((frame, bytes.clone()));
                        bytes
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Skipping preview frame");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Preview encoder task failed");
                        continue;
                    }
                }
            }
        };
        return Some((Ok(part(&jpeg)), st));
    }
}

/// Preview body for one client.
pub fn mjpeg_body(service: Arc<CameraService>) -> Body {
    let quality = service.stream_config().mjpeg_quality;
    let period = Duration::from_millis(service.stream_config().mjpeg_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let state = MjpegState {
        service,
        ticker,
        quality,
        cached: None,
    };
    Body::from_stream(futures::stream::unfold(state, next_part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_has_boundary_headers_and_payload() {
        let bytes = part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n"));
        assert!(bytes.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn content_type_names_boundary() {
        assert_eq!(content_type(), "multipart/x-mixed-replace; boundary=frame");
    }
}
