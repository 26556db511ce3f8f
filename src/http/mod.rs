//! HTTP surface.
//!
//! | Method | Path                        | Operation                         |
//! |--------|-----------------------------|-----------------------------------|
//! | GET    | `/status`                   | camera, sequence, stream, alerts  |
//! | POST   | `/camera/connect`           | open and configure                |
//! | POST   | `/camera/disconnect`        | stop everything, close            |
//! | POST   | `/camera/stream/start`      | start preview acquisition         |
//! | POST   | `/camera/stream/stop`       | stop preview acquisition          |
//! | GET    | `/camera/stream`            | MJPEG preview                     |
//! | GET    | `/camera/snapshot`          | single exposure as JPEG           |
//! | POST   | `/camera/settings`          | partial settings update           |
//! | POST   | `/camera/sequence/start`    | background sequence to disk       |
//! | POST   | `/camera/sequence/stop`     | request sequence stop             |
//! | GET    | `/camera/sequence/status`   | sequence job                      |
//! | POST   | `/camera/sequence/capture`  | synchronous batch, multipart JPEG |

pub mod error;
pub mod handlers;
pub mod mjpeg;

use crate::camera::CameraService;
use axum::routing::{get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Router over one camera service.
pub fn router(service: Arc<CameraService>) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/camera/connect", post(handlers::connect))
        .route("/camera/disconnect", post(handlers::disconnect))
        .route("/camera/stream/start", post(handlers::stream_start))
        .route("/camera/stream/stop", post(handlers::stream_stop))
        .route("/camera/stream", get(handlers::stream))
        .route("/camera/snapshot", get(handlers::snapshot))
        .route("/camera/settings", post(handlers::apply_settings))
        .route("/camera/sequence/start", post(handlers::sequence_start))
        .route("/camera/sequence/stop", post(handlers::sequence_stop))
        .route("/camera/sequence/status", get(handlers::sequence_status))
        .route("/camera/sequence/capture", post(handlers::sequence_capture))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(service: Arc<CameraService>, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
