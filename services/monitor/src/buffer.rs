//! Per-camera frame buffer with periodic flush.
//!
//! Workers add annotated frames; a ticker flushes them to the image
//! directory and, when configured, to [`Storage`]. A flush attempts every
//! buffered frame once and then forgets the whole batch, whether or not
//! each frame persisted.

use crate::config::BufferConfig;
use crate::detector::Detection;
use crate::storage::{NewImage, Storage};
use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Timestamp layout used in flushed file names.
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M_%S%.3f";

/// How many milliseconds a file name may be pushed forward to avoid a collision.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// A frame waiting for the next flush.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    /// When the frame was accepted
    pub timestamp: DateTime<Local>,
    pub camera_id: String,
    pub detections: Vec<Detection>,
    /// Encoded (usually annotated) image
    pub image: Vec<u8>,
}

/// Frame buffer statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    /// Frames currently waiting for a flush
    pub buffered: usize,
    /// Frames rejected because their camera was at the limit
    pub dropped_cap: u64,
    /// Frames persisted across all flushes
    pub saved: u64,
    /// Frames lost to a write or insert failure
    pub failed: u64,
    /// Completed flushes that had at least one frame
    pub flushes: u64,
}

/// Outcome of a single flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

#[derive(Default)]
struct BufferState {
    frames: Vec<BufferedFrame>,
    per_camera: HashMap<String, usize>,
}

/// Build the on-disk name of a flushed frame:
/// `<timestamp>_<camera>_<label1>_<label2>_..._.jpg`.
pub fn frame_filename<S: AsRef<str>>(timestamp: &str, camera_id: &str, labels: &[S]) -> String {
    let mut name = format!("{}_{}_", timestamp, sanitize(camera_id));
    for label in labels {
        name.push_str(&sanitize(label.as_ref()));
        name.push('_');
    }
    name.push_str(".jpg");
    name
}

fn sanitize(part: &str) -> String {
    part.replace(['/', '\\'], "_")
}

/// Bounded accumulation of accepted frames.
pub struct FrameBuffer {
    image_dir: PathBuf,
    per_camera_limit: usize,
    storage: Option<Arc<dyn Storage>>,
    state: Mutex<BufferState>,
    flush_lock: tokio::sync::Mutex<()>,
    stats: RwLock<BufferStats>,
}

impl FrameBuffer {
    pub fn new(config: &BufferConfig, storage: Option<Arc<dyn Storage>>) -> Self {
        Self {
            image_dir: config.image_dir.clone(),
            per_camera_limit: config.per_camera_limit,
            storage,
            state: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            stats: RwLock::new(BufferStats::default()),
        }
    }

    /// Buffer a frame for the next flush.
    ///
    /// Returns `false` when the camera already holds `per_camera_limit`
    /// frames; the frame is dropped.
    pub fn add(&self, image: Vec<u8>, camera_id: &str, detections: Vec<Detection>) -> bool {
        let mut state = self.state.lock();

        let count = state.per_camera.entry(camera_id.to_string()).or_insert(0);
        if *count >= self.per_camera_limit {
            drop(state);
            self.stats.write().dropped_cap += 1;
            metrics::counter!("watchpost.buffer.dropped_cap").increment(1);
            debug!(camera_id = %camera_id, limit = self.per_camera_limit, "Camera buffer full, frame dropped");
            return false;
        }
        *count += 1;

        state.frames.push(BufferedFrame {
            timestamp: Local::now(),
            camera_id: camera_id.to_string(),
            detections,
            image,
        });

        debug!(camera_id = %camera_id, buffered = state.frames.len(), "Frame buffered");
        true
    }

    /// Number of frames waiting for a flush.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Check if nothing is waiting for a flush.
    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Frames currently held for `camera_id`.
    pub fn camera_count(&self, camera_id: &str) -> usize {
        self.state
            .lock()
            .per_camera
            .get(camera_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BufferStats {
        let mut stats = self.stats.read().clone();
        stats.buffered = self.len();
        stats
    }

    /// Persist every buffered frame once and clear the buffer.
    ///
    /// The batch is taken out of the buffer before any I/O, so `add` keeps
    /// working while a flush is in progress and those frames land in the
    /// next batch. Concurrent flushes run one at a time.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let frames = {
            let mut state = self.state.lock();
            if state.frames.is_empty() {
                return FlushReport::default();
            }
            state.per_camera.clear();
            std::mem::take(&mut state.frames)
        };

        info!(frames = frames.len(), "Flushing frame buffer");

        if let Err(e) = tokio::fs::create_dir_all(&self.image_dir).await {
            error!(dir = %self.image_dir.display(), error = %e, "Failed to create image directory");
        }

        let mut report = FlushReport::default();
        for frame in &frames {
            if self.persist(frame).await {
                report.saved += 1;
            } else {
                report.failed += 1;
            }
        }

        {
            let mut stats = self.stats.write();
            stats.saved += report.saved as u64;
            stats.failed += report.failed as u64;
            stats.flushes += 1;
        }
        metrics::counter!("watchpost.flush.saved").increment(report.saved as u64);
        metrics::counter!("watchpost.flush.failed").increment(report.failed as u64);

        info!(saved = report.saved, failed = report.failed, "Flush completed");
        report
    }

    /// Write the frame under a name no other file uses.
    ///
    /// Frames of one camera with the same labels can share a millisecond, so
    /// a taken name moves the timestamp forward one millisecond at a time.
    async fn write_image(&self, frame: &BufferedFrame) -> io::Result<(String, PathBuf, DateTime<Local>)> {
        let labels: Vec<&str> = frame.detections.iter().map(|d| d.label.as_str()).collect();
        let mut timestamp = frame.timestamp;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let filename = frame_filename(
                &timestamp.format(FILENAME_TIMESTAMP_FORMAT).to_string(),
                &frame.camera_id,
                &labels,
            );
            let path = self.image_dir.join(&filename);

            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    timestamp += chrono::Duration::milliseconds(1);
                    continue;
                }
                Err(e) => return Err(e),
            };

            file.write_all(&frame.image).await?;
            file.flush().await?;
            return Ok((filename, path, timestamp));
        }

        Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free file name for camera {}", frame.camera_id),
        ))
    }

    async fn persist(&self, frame: &BufferedFrame) -> bool {
        let (filename, path, timestamp) = match self.write_image(frame).await {
            Ok(written) => written,
            Err(e) => {
                error!(camera_id = %frame.camera_id, dir = %self.image_dir.display(), error = %e, "Failed to write image");
                return false;
            }
        };

        let Some(storage) = &self.storage else {
            debug!(file = %filename, "Image saved");
            return true;
        };

        let image = NewImage {
            filename: filename.clone(),
            camera: frame.camera_id.clone(),
            timestamp: timestamp.with_timezone(&Utc),
            path: path.display().to_string(),
            size: frame.image.len() as i64,
        };

        let image_id = match storage.save_image(&image).await {
            Ok(id) => id,
            Err(e) => {
                error!(file = %filename, error = %e, "Failed to save image metadata");
                return false;
            }
        };

        if let Err(e) = storage.save_detections(image_id, &frame.detections).await {
            error!(file = %filename, image_id = image_id, error = %e, "Failed to save detections");
            return false;
        }

        debug!(file = %filename, image_id = image_id, "Image saved");
        true
    }

    /// Flush every `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Frame buffer flush loop started");

        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        info!("Frame buffer flush loop stopped");
    }
}
