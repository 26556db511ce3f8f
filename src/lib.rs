//! # asicam
//!
//! Control service for a single ZWO ASI camera. One physical sensor is shared between
//! three access modes, a live MJPEG preview, single exposures and timed sequences, and
//! exposed to concurrent HTTP clients.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the [`HardwareHandle`](hardware::HardwareHandle) trait, the
//!   ASICamera2 SDK backend loaded at runtime and a simulated camera.
//! - **`camera`**: the state store and its gate, the stream engine, the exposure runner,
//!   sequence jobs, settings application and the [`CameraService`](camera::CameraService)
//!   tying them together.
//! - **`data`**: frame to image conversion and on-disk persistence for sequences.
//! - **`http`**: axum router, error responses and the MJPEG body.
//! - **`config`**: layered configuration (defaults, TOML file, `ASICAM_*` environment).
//! - **`error`**: the error taxonomy shared by all of the above.
//! - **`logging`**: tracing subscriber setup.

pub mod camera;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod http;
pub mod logging;
