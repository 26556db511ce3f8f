//! Sequence Controller
//!
//! Timed multi-photo capture in a background task. Each iteration:
//!
//! 1. stop the stream if one is running
//! 2. run one exposure through the [`ExposureRunner`]
//! 3. write the frame with the job's [`FrameWriter`] (blocking pool)
//! 4. sleep `interval` unless this was the last photo or a stop was requested
//!
//! A transient failure skips that photo (`failed_count`, `last_error`). A fatal one
//! (camera gone) ends the job with [`StopReason::Fault`]. `stop()` never waits for the
//! worker: it flips the flag, wakes the interval sleep and marks the job inactive. An
//! exposure already in flight is allowed to finish but its frame is discarded.
//!
//! [`SequenceController::capture_batch`] runs the same per-photo step synchronously and
//! hands the frames back instead of writing them.
//!
//! A job or batch claims the camera in [`CameraStateStore`] for its whole run. Stream
//! starts and snapshots are refused with `AlreadyRunning` until the claim is released.

use crate::camera::exposure::ExposureRunner;
use crate::camera::state::{CameraStateStore, Mode};
use crate::camera::stream::StreamEngine;
use crate::data::storage::{FileFormat, FrameWriter};
use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::hardware::Frame;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every iteration ran
    Completed,
    /// `stop()` was called
    Stopped,
    /// The camera was lost
    Fault,
}

/// Snapshot of the current (or last) sequence job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceJob {
    /// Worker still producing photos
    pub active: bool,
    /// Photos written so far
    pub current_count: u32,
    /// Photos requested
    pub total_count: u32,
    /// Output directory
    pub save_path: String,
    /// Output format as requested
    pub file_format: String,
    /// Pause between photos
    pub interval_seconds: f64,
    /// Photos skipped after a transient failure
    pub failed_count: u32,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Job start
    pub started_at: Option<DateTime<Utc>>,
    /// Worker exit
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once the job is no longer active
    pub stop_reason: Option<StopReason>,
}

/// Body of `POST /camera/sequence/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceRequest {
    /// Output directory, created if missing
    pub save_path: String,
    /// Number of photos
    pub count: i64,
    /// `png`, `jpg`/`jpeg`, `tif`/`tiff` or `raw`
    pub file_format: String,
    /// Seconds between photos
    #[serde(default)]
    pub interval: f64,
    /// Restart the stream after the job if it was running before
    #[serde(default)]
    pub resume_stream: bool,
}

/// Frames returned by a synchronous batch.
#[derive(Debug, Clone, Default)]
pub struct BatchCapture {
    /// Successful captures, in order
    pub frames: Vec<Frame>,
    /// One message per skipped photo
    pub failures: Vec<String>,
}

struct SequenceWorker {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl SequenceWorker {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Everything the background task needs.
#[derive(Clone)]
struct SequenceContext {
    store: Arc<CameraStateStore>,
    stream: Arc<StreamEngine>,
    runner: ExposureRunner,
    job: Arc<Mutex<SequenceJob>>,
}

/// Claim on the camera held by a job or batch; released on drop, however it ends.
struct JobClaim(Arc<CameraStateStore>);

impl JobClaim {
    fn acquire(store: &Arc<CameraStateStore>) -> Option<Self> {
        store.try_claim_job().then(|| JobClaim(Arc::clone(store)))
    }
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.0.release_job();
    }
}

/// Owner of the sequence job and its worker.
pub struct SequenceController {
    ctx: SequenceContext,
    worker: Mutex<Option<SequenceWorker>>,
    jpeg_quality: u8,
}

fn interval_from(seconds: f64) -> Result<Duration, ValidationError> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ValidationError::InvalidValue {
            field: "interval",
            reason: format!("{seconds} is not a non-negative number of seconds"),
        });
    }
    Duration::try_from_secs_f64(seconds).map_err(|e| ValidationError::InvalidValue {
        field: "interval",
        reason: e.to_string(),
    })
}

fn count_from(count: i64) -> ServiceResult<u32> {
    match u32::try_from(count) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ServiceError::InvalidCount(count)),
    }
}

impl SequenceController {
    /// Controller sharing the camera with `stream`.
    pub fn new(
        store: Arc<CameraStateStore>,
        stream: Arc<StreamEngine>,
        runner: ExposureRunner,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            ctx: SequenceContext {
                store,
                stream,
                runner,
                job: Arc::new(Mutex::new(SequenceJob::default())),
            },
            worker: Mutex::new(None),
            jpeg_quality,
        }
    }

    /// Validate the request, create the output directory and spawn the worker.
    ///
    /// # Errors
    /// - [`ServiceError::InvalidCount`] for `count < 1`
    /// - [`ServiceError::UnsupportedFileFormat`], [`ServiceError::Validation`] for a bad interval
    /// - [`ServiceError::NotConnected`]
    /// - [`ServiceError::AlreadyRunning`] while a job or batch is active, or the previous
    ///   worker is still winding down
    /// - [`ServiceError::Storage`] if the directory cannot be created
    pub fn start(&self, request: SequenceRequest) -> ServiceResult<SequenceJob> {
        let total = count_from(request.count)?;
        let interval = interval_from(request.interval)?;
        let format: FileFormat = request.file_format.parse()?;
        self.ctx.store.require_connected()?;

        let mut worker = self.worker.lock();
        if self.ctx.job.lock().active || worker.as_ref().is_some_and(SequenceWorker::is_alive) {
            return Err(ServiceError::AlreadyRunning);
        }
        let claim = JobClaim::acquire(&self.ctx.store).ok_or(ServiceError::AlreadyRunning)?;

        let writer = FrameWriter::create(&request.save_path, format, self.jpeg_quality)?;
        let job = SequenceJob {
            active: true,
            current_count: 0,
            total_count: total,
            save_path: request.save_path.clone(),
            file_format: request.file_format.clone(),
            interval_seconds: request.interval,
            failed_count: 0,
            last_error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            stop_reason: None,
        };
        *self.ctx.job.lock() = job.clone();

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(run_sequence(
            self.ctx.clone(),
            claim,
            writer,
            total,
            interval,
            request.resume_stream,
            Arc::clone(&stop),
            Arc::clone(&wake),
        ));
        *worker = Some(SequenceWorker { stop, wake, handle });

        tracing::info!(
            total,
            interval_s = request.interval,
            format = %format,
            save_path = %request.save_path,
            "Sequence capture started"
        );
        Ok(job)
    }

    /// Ask the worker to finish and mark the job inactive. Returns immediately.
    ///
    /// Calling with no active job is a no-op.
    pub fn stop(&self) -> ServiceResult<SequenceJob> {
        if let Some(w) = self.worker.lock().as_ref() {
            w.stop.store(true, Ordering::Release);
            w.wake.notify_one();
        }
        let mut job = self.ctx.job.lock();
        if job.active {
            job.active = false;
            job.stop_reason = Some(StopReason::Stopped);
            tracing::info!(
                current = job.current_count,
                total = job.total_count,
                "Sequence capture stop requested"
            );
        }
        Ok(job.clone())
    }

    /// Copy of the job record; an inactive default if no job has run.
    pub fn status(&self) -> SequenceJob {
        self.ctx.job.lock().clone()
    }

    /// Wait for the worker, if any, to exit.
    pub async fn join(&self) {
        let worker = self.worker.lock().take();
        if let Some(w) = worker {
            if let Err(e) = w.handle.await {
                tracing::error!(error = %e, "Sequence worker panicked");
            }
        }
    }

    /// Capture `count` photos and return them, without touching the disk.
    ///
    /// Stops an active stream first and does not restart it.
    ///
    /// # Errors
    /// Same preconditions as [`start`](Self::start); a fatal hardware error aborts the batch.
    pub async fn capture_batch(&self, count: i64, interval_seconds: f64) -> ServiceResult<BatchCapture> {
        let total = count_from(count)?;
        let interval = interval_from(interval_seconds)?;
        self.ctx.store.require_connected()?;

        let _claim = {
            let worker = self.worker.lock();
            if self.ctx.job.lock().active || worker.as_ref().is_some_and(SequenceWorker::is_alive) {
                return Err(ServiceError::AlreadyRunning);
            }
            JobClaim::acquire(&self.ctx.store).ok_or(ServiceError::AlreadyRunning)?
        };

        tracing::info!(total, interval_s = interval_seconds, "Batch capture started");
        let mut batch = BatchCapture::default();
        for index in 1..=total {
            if self.ctx.store.mode() == Mode::Streaming {
                self.ctx.stream.stop().await?;
            }
            match self.ctx.runner.expose().await {
                Ok(frame) => batch.frames.push(frame),
                Err(e) if e.is_fatal() => {
                    tracing::error!(index, error = %e, "Batch capture aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "Batch photo skipped");
                    batch.failures.push(format!("photo {index}: {e}"));
                }
            }
            if index < total && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        tracing::info!(
            captured = batch.frames.len(),
            failed = batch.failures.len(),
            "Batch capture finished"
        );
        Ok(batch)
    }
}

async fn run_sequence(
    ctx: SequenceContext,
    claim: JobClaim,
    writer: FrameWriter,
    total: u32,
    interval: Duration,
    resume_stream: bool,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    let mut fault = false;
    let mut paused_stream = false;

    for index in 1..=total {
        if stop.load(Ordering::Acquire) {
            break;
        }

        if ctx.store.mode() == Mode::Streaming {
            paused_stream = true;
            if let Err(e) = ctx.stream.stop().await {
                tracing::error!(error = %e, "Could not stop the stream for the sequence");
                ctx.job.lock().last_error = Some(e.to_string());
                fault = true;
                break;
            }
        }

        match ctx.runner.expose().await {
            Ok(frame) => {
                if stop.load(Ordering::Acquire) {
                    tracing::debug!(index, "Discarding frame completed after stop");
                    break;
                }
                let w = writer.clone();
                let written = tokio::task::spawn_blocking(move || w.write(&frame, index))
                    .await
                    .map_err(ServiceError::from)
                    .and_then(|r| r);
                match written {
                    Ok(path) => {
                        let mut job = ctx.job.lock();
                        job.current_count += 1;
                        tracing::info!(
                            index,
                            total,
                            path = %path.display(),
                            "Sequence photo saved"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(index, error = %e, "Sequence photo could not be saved");
                        ctx.store.record_fault(&e);
                        let mut job = ctx.job.lock();
                        job.failed_count += 1;
                        job.last_error = Some(e.to_string());
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(index, error = %e, "Sequence aborted, camera lost");
                let mut job = ctx.job.lock();
                job.failed_count += 1;
                job.last_error = Some(e.to_string());
                fault = true;
                break;
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Sequence photo skipped");
                let mut job = ctx.job.lock();
                job.failed_count += 1;
                job.last_error = Some(e.to_string());
            }
        }

        if index < total && !interval.is_zero() && !stop.load(Ordering::Acquire) {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }
    }

    let (current, failed) = {
        let mut job = ctx.job.lock();
        if job.active {
            job.active = false;
            job.stop_reason = Some(if fault {
                StopReason::Fault
            } else {
                StopReason::Completed
            });
        }
        job.finished_at = Some(Utc::now());
        (job.current_count, job.failed_count)
    };
    tracing::info!(current, total, failed, "Sequence capture finished");

    // The stream refuses to start while the claim is held.
    drop(claim);
    if resume_stream && paused_stream && !fault {
        if let Err(e) = ctx.stream.start().await {
            tracing::warn!(error = %e, "Could not resume the stream after the sequence");
        }
    }
}
