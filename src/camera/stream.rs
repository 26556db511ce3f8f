//! Stream Engine
//!
//! Owns the background acquisition loop while the camera is `Streaming`.
//!
//! ## Architecture
//!
//! ```text
//!  start() ──► enter(Streaming) ──► prepare video (gate) ──► spawn_blocking(loop)
//!                                                                 │
//!            ┌────────────────────────────────────────────────────┘
//!            ▼
//!   loop { gate: poll_video_frame(timeout) ──► FrameSlot::publish }   (until stop flag)
//!
//!  stop()  ──► set flag ──► join loop ──► stop_video_capture (gate) ──► leave(Streaming)
//! ```
//!
//! The gate is taken once per poll, never across the loop, so settings and status
//! requests interleave with acquisition. Stop latency is bounded by one poll timeout.
//!
//! The [`FrameSlot`] keeps only the newest frame. Consumers clone the `Arc` and never
//! see a half-written buffer.

use crate::camera::settings::write_image_controls;
use crate::camera::state::{CameraSettings, CameraStateStore, Mode};
use crate::config::StreamConfig;
use crate::error::{HwError, ServiceError, ServiceResult};
use crate::hardware::{Control, Frame, HardwareHandle, ImageFormat};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Log the first failure and every Nth after it at `warn`; the rest go to `debug`.
const FAILURE_LOG_EVERY: u32 = 10;

/// Publication counters for `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    /// Frames published since the service started
    pub frames_published: u64,
    /// Capture time of the newest published frame
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// Single-slot, overwrite-on-publish frame buffer.
pub struct FrameSlot {
    tx: watch::Sender<Option<Arc<Frame>>>,
    published: AtomicU64,
    last_frame_at: Mutex<Option<DateTime<Utc>>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    /// Empty slot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            published: AtomicU64::new(0),
            last_frame_at: Mutex::new(None),
        }
    }

    /// Replace the current frame.
    pub fn publish(&self, frame: Frame) {
        let captured_at = frame.captured_at;
        self.tx.send_replace(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.lock() = Some(captured_at);
    }

    /// Drop the current frame so it is never served again.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Newest frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().clone()
    }

    /// Change notifications for consumers that want to wait for the next frame.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.tx.subscribe()
    }

    /// Publication counters.
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_published: self.published.load(Ordering::Relaxed),
            last_frame_at: *self.last_frame_at.lock(),
        }
    }
}

struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Start/stop control over video acquisition.
pub struct StreamEngine {
    store: Arc<CameraStateStore>,
    slot: Arc<FrameSlot>,
    config: StreamConfig,
    worker: tokio::sync::Mutex<Option<StreamWorker>>,
}

impl StreamEngine {
    /// Engine publishing into a fresh [`FrameSlot`].
    pub fn new(store: Arc<CameraStateStore>, config: StreamConfig) -> Self {
        Self {
            store,
            slot: Arc::new(FrameSlot::new()),
            config,
            worker: tokio::sync::Mutex::new(None),
        }
    }

    /// The buffer this engine publishes into.
    pub fn slot(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.slot)
    }

    /// Whether an acquisition loop is alive.
    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Enter `Streaming` and spawn the acquisition loop.
    ///
    /// Calling while already streaming is a successful no-op.
    ///
    /// # Errors
    /// - [`ServiceError::NotConnected`] without an open camera
    /// - [`ServiceError::State`] while an exposure is running
    /// - [`ServiceError::AlreadyRunning`] while a sequence job or batch holds the camera
    /// - [`ServiceError::Hardware`] if video mode cannot be started (mode is back at `Idle`)
    pub async fn start(&self) -> ServiceResult<()> {
        let mut worker = self.worker.lock().await;
        if self.store.job_busy() {
            return Err(ServiceError::AlreadyRunning);
        }
        self.start_locked(&mut worker).await
    }

    /// Stop the acquisition loop and leave `Streaming`. Idempotent.
    pub async fn stop(&self) -> ServiceResult<()> {
        let mut worker = self.worker.lock().await;
        self.stop_locked(&mut worker).await
    }

    /// Hold off every start and stop until the returned guard is dropped.
    pub(crate) async fn lock(&self) -> EngineLock<'_> {
        EngineLock {
            engine: self,
            worker: self.worker.lock().await,
        }
    }

    async fn start_locked(&self, worker: &mut Option<StreamWorker>) -> ServiceResult<()> {
        if let Some(w) = worker.as_ref() {
            if !w.handle.is_finished() && self.store.mode() == Mode::Streaming {
                tracing::debug!("Stream already running");
                return Ok(());
            }
        }
        // A loop that ended on its own (fault, disconnect) is reaped here.
        if let Some(stale) = worker.take() {
            stale.stop.store(true, Ordering::Release);
            if let Err(e) = stale.handle.await {
                tracing::warn!(error = %e, "Previous acquisition loop ended abnormally");
            }
        }

        self.store.enter(Mode::Streaming)?;

        let state = self.store.snapshot();
        let settings = state.settings.clone();
        let (width, height) = (state.width, state.height);
        let prepared = self
            .store
            .run_hardware(move |hw| prepare_video(hw, &settings, width, height))
            .await;

        match prepared {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.store.leave(Mode::Streaming);
                self.store.record_hw_error(&e);
                return Err(e.into());
            }
            Err(e) => {
                self.store.leave(Mode::Streaming);
                self.store.record_service_error(&e);
                return Err(e);
            }
        }
        self.store.clear_fault();
        self.slot.clear();

        let stop = Arc::new(AtomicBool::new(false));
        let poll_timeout = self.config.video_poll_timeout(state.settings.video_exposure_us);
        let max_failures = self.config.max_consecutive_timeouts.max(1);
        let handle = {
            let store = Arc::clone(&self.store);
            let slot = Arc::clone(&self.slot);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                acquisition_loop(&store, &slot, &stop, poll_timeout, max_failures);
            })
        };
        *worker = Some(StreamWorker { stop, handle });

        tracing::info!(
            width,
            height,
            video_exposure_us = state.settings.video_exposure_us,
            poll_timeout_ms = poll_timeout.as_millis() as u64,
            "Video stream started"
        );
        Ok(())
    }

    async fn stop_locked(&self, worker: &mut Option<StreamWorker>) -> ServiceResult<()> {
        let Some(w) = worker.take() else {
            // Nothing to join; still make sure the mode is consistent.
            self.store.leave(Mode::Streaming);
            return Ok(());
        };

        w.stop.store(true, Ordering::Release);
        if let Err(e) = w.handle.await {
            tracing::error!(error = %e, "Acquisition loop panicked");
            self.store.record_fault(ServiceError::from(e));
        }

        if self.store.snapshot().connected {
            match self.store.run_hardware(|hw| hw.stop_video_capture()).await? {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Stopping video capture failed");
                    self.store.record_hw_error(&e);
                }
            }
        }
        self.store.leave(Mode::Streaming);
        tracing::info!("Video stream stopped");
        Ok(())
    }
}

/// Engine lock held across a multi-step update.
pub(crate) struct EngineLock<'a> {
    engine: &'a StreamEngine,
    worker: tokio::sync::MutexGuard<'a, Option<StreamWorker>>,
}

impl EngineLock<'_> {
    /// Stop, run `apply`, start again with a cleared slot.
    ///
    /// Video sessions do not pick up control changes, so settings changes while
    /// streaming go through here. If no loop is running `apply` still runs and `false`
    /// is returned.
    pub(crate) async fn restart_with<F>(&mut self, apply: F) -> ServiceResult<bool>
    where
        F: FnOnce() + Send,
    {
        let running = self.worker.as_ref().is_some_and(|w| !w.handle.is_finished());
        if !running {
            apply();
            return Ok(false);
        }
        self.engine.stop_locked(&mut self.worker).await?;
        apply();
        tracing::info!("Restarting video stream with new settings");
        self.engine.start_locked(&mut self.worker).await?;
        Ok(true)
    }
}

/// Write the video settings and enter video mode. Runs under the gate.
fn prepare_video(
    hw: &mut dyn HardwareHandle,
    settings: &CameraSettings,
    width: u32,
    height: u32,
) -> Result<(), HwError> {
    let video_us = i64::try_from(settings.video_exposure_us).unwrap_or(i64::MAX);
    hw.configure_format(ImageFormat::Rgb24, width, height)?;
    // The stored video exposure is the auto-exposure ceiling.
    hw.set_control(Control::AutoMaxExposure, video_us, false)?;
    hw.set_control(Control::Exposure, video_us, true)?;
    write_image_controls(hw, settings)?;
    hw.start_video_capture()
}

fn acquisition_loop(
    store: &CameraStateStore,
    slot: &FrameSlot,
    stop: &AtomicBool,
    poll_timeout: Duration,
    max_failures: u32,
) {
    let mut failures: u32 = 0;

    while !stop.load(Ordering::Acquire) {
        match store.with_hardware(|hw| hw.poll_video_frame(poll_timeout)) {
            Ok(frame) => {
                if failures > 0 {
                    tracing::info!(failures, "Video frames flowing again");
                }
                failures = 0;
                slot.publish(frame);
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Video capture lost the camera");
                store.record_hw_error(&e);
                slot.clear();
                return;
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % FAILURE_LOG_EVERY == 0 {
                    tracing::warn!(error = %e, failures, "Video poll failed");
                } else {
                    tracing::debug!(error = %e, failures, "Video poll failed");
                }

                if failures >= max_failures {
                    store.record_fault(format!(
                        "video capture stalled after {failures} consecutive failures: {e}"
                    ));
                    if let Err(e) = store.with_hardware(|hw| hw.stop_video_capture()) {
                        tracing::warn!(error = %e, "Stopping stalled video capture failed");
                    }
                    store.leave(Mode::Streaming);
                    return;
                }
            }
        }
    }
    tracing::debug!("Acquisition loop exited on request");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(fill: u8) -> Frame {
        Frame::new(ImageFormat::Raw8, 8, 2, vec![fill; 16])
    }

    #[test]
    fn slot_keeps_only_newest() {
        let slot = FrameSlot::new();
        assert!(slot.latest().is_none());

        slot.publish(frame(1));
        slot.publish(frame(2));
        assert_eq!(slot.latest().map(|f| f.bytes[0]), Some(2));
        assert_eq!(slot.stats().frames_published, 2);
        assert!(slot.stats().last_frame_at.is_some());

        slot.clear();
        assert!(slot.latest().is_none());
        assert_eq!(slot.stats().frames_published, 2);
    }

    #[tokio::test]
    async fn subscribers_see_publications() {
        let slot = FrameSlot::new();
        let mut rx = slot.subscribe();
        slot.publish(frame(9));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|f| f.bytes[0]), Some(9));
    }
}
