//! Per-frame policy: broadcast, decimate, motion gate, enqueue.
//!
//! `handle_frame` is called from every camera connection. It never waits on
//! detection or on viewers: the broadcast and the enqueue are both
//! non-blocking, and only the cheap motion check runs inline.

use crate::config::ProcessingConfig;
use crate::detector::Detector;
use crate::hub::{encode_frame_message, HubError, HubHandle};
use crate::queue::{ProcessingTask, QueueError, TaskQueue};
use crate::registry::CameraRegistry;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub frames_received: u64,
    pub frames_broadcast: u64,
    pub frames_motion: u64,
    pub frames_queued: u64,
    pub frames_dropped_queue_full: u64,
    pub motion_errors: u64,
}

/// Central per-frame decision point.
pub struct Dispatcher {
    motion_detector: Arc<dyn Detector>,
    hub: HubHandle,
    queue: Arc<TaskQueue>,
    frame_counters: CameraRegistry<AtomicU64>,
    process_every_nth: AtomicU64,
    stats: RwLock<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(
        config: &ProcessingConfig,
        motion_detector: Arc<dyn Detector>,
        hub: HubHandle,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            motion_detector,
            hub,
            queue,
            frame_counters: CameraRegistry::new(),
            process_every_nth: AtomicU64::new(config.process_every_nth.max(1)),
            stats: RwLock::new(DispatcherStats::default()),
        }
    }

    /// Handle one complete frame from `camera_id`.
    pub fn handle_frame(&self, frame: Vec<u8>, camera_id: &str) {
        self.stats.write().frames_received += 1;
        metrics::counter!("watchpost.frames.received").increment(1);

        if self.hub.client_count() > 0 {
            self.broadcast(&frame, camera_id);
        }

        let seen = self
            .frame_counters
            .get_or_create(camera_id)
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if seen % self.processing_interval() != 0 {
            return;
        }

        match self.motion_detector.detect_motion(&frame, camera_id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                self.stats.write().motion_errors += 1;
                warn!(camera_id = %camera_id, error = %e, "Motion detection failed");
                return;
            }
        }

        self.stats.write().frames_motion += 1;
        metrics::counter!("watchpost.frames.motion").increment(1);

        let task = ProcessingTask {
            camera_id: camera_id.to_string(),
            frame,
        };

        match self.queue.try_submit(task) {
            Ok(()) => {
                self.stats.write().frames_queued += 1;
                metrics::counter!("watchpost.frames.queued").increment(1);
                debug!(camera_id = %camera_id, queued = self.queue.len(), "Frame queued for detection");
            }
            Err(QueueError::Full) => {
                self.stats.write().frames_dropped_queue_full += 1;
                metrics::counter!("watchpost.frames.dropped_queue_full").increment(1);
                warn!(
                    camera_id = %camera_id,
                    queue_capacity = self.queue.capacity(),
                    "Task queue full, frame dropped"
                );
            }
            Err(QueueError::Closed) => {
                debug!(camera_id = %camera_id, "Task queue closed, frame dropped");
            }
        }
    }

    fn broadcast(&self, frame: &[u8], camera_id: &str) {
        let message = match encode_frame_message(camera_id, frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "Failed to encode viewer message");
                return;
            }
        };

        match self.hub.broadcast(message) {
            Ok(()) => self.stats.write().frames_broadcast += 1,
            Err(HubError::Busy) => debug!(camera_id = %camera_id, "Hub busy, viewer frame dropped"),
            Err(HubError::Closed) => debug!(camera_id = %camera_id, "Hub closed, viewer frame dropped"),
        }
    }

    /// Offer only every `n`th frame of each camera to the motion gate.
    /// Values below 1 are treated as 1.
    pub fn set_processing_interval(&self, n: u64) {
        let n = n.max(1);
        self.process_every_nth.store(n, Ordering::Relaxed);
        info!(every_nth = n, "Processing interval updated");
    }

    pub fn processing_interval(&self) -> u64 {
        self.process_every_nth.load(Ordering::Relaxed)
    }

    /// Frames received per camera since the last counter reset.
    pub fn frame_stats(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        self.frame_counters.for_each(|camera_id, count| {
            counts.insert(camera_id.to_string(), count.load(Ordering::Relaxed));
        });
        counts
    }

    pub fn reset_frame_counters(&self) {
        self.frame_counters.clear();
        info!("Frame counters reset");
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.read().clone()
    }
}
