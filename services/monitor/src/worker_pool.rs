//! Object detection worker pool.
//!
//! Each worker is an OS thread that owns exactly one detector and blocks on
//! the shared task queue. Detection is CPU bound, so the workers stay off
//! the async runtime.

use crate::buffer::FrameBuffer;
use crate::detector::{Detector, DetectorError};
use crate::queue::{ProcessingTask, TaskQueue};
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker pool statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerPoolStats {
    pub tasks_processed: u64,
    pub frames_with_detections: u64,
    pub detector_errors: u64,
    pub annotation_fallbacks: u64,
}

/// Fixed set of detection workers.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<RwLock<WorkerPoolStats>>,
}

impl WorkerPool {
    /// Start one worker per detector, all consuming from `receiver`.
    pub fn start(
        detectors: Vec<Box<dyn Detector>>,
        queue: Arc<TaskQueue>,
        receiver: Receiver<ProcessingTask>,
        buffer: Arc<FrameBuffer>,
    ) -> std::io::Result<Self> {
        let stats = Arc::new(RwLock::new(WorkerPoolStats::default()));
        let mut workers = Vec::with_capacity(detectors.len());

        for (worker_id, detector) in detectors.into_iter().enumerate() {
            let worker = Worker {
                id: worker_id,
                detector,
                receiver: receiver.clone(),
                buffer: buffer.clone(),
                stats: stats.clone(),
            };

            let handle = std::thread::Builder::new()
                .name(format!("detector-{}", worker_id))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }

        info!(workers = workers.len(), queue_capacity = queue.capacity(), "Worker pool started");

        Ok(Self {
            queue,
            workers,
            stats,
        })
    }

    /// Number of running workers.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.stats.read().clone()
    }

    /// Handle to the statistics, readable after the pool is gone.
    pub fn stats_handle(&self) -> Arc<RwLock<WorkerPoolStats>> {
        self.stats.clone()
    }

    /// Close the queue and wait for every worker to finish the tasks that
    /// were already queued.
    pub fn shutdown(self) {
        info!(pending = self.queue.len(), "Shutting down worker pool");
        self.queue.close();

        for handle in self.workers {
            let name = handle.thread().name().unwrap_or("detector").to_string();
            if handle.join().is_err() {
                error!(worker = %name, "Worker panicked");
            }
        }

        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    detector: Box<dyn Detector>,
    receiver: Receiver<ProcessingTask>,
    buffer: Arc<FrameBuffer>,
    stats: Arc<RwLock<WorkerPoolStats>>,
}

impl Worker {
    fn run(self) {
        debug!(worker_id = self.id, "Worker started");

        // ends once the queue is closed and drained
        for task in self.receiver.iter() {
            self.process(task);
        }

        debug!(worker_id = self.id, "Worker stopped");
    }

    fn process(&self, task: ProcessingTask) {
        let ProcessingTask { camera_id, frame } = task;

        let detections = match self.detector.detect_objects(&frame) {
            Ok(detections) => detections,
            Err(DetectorError::ModelUnavailable(reason)) => {
                // reported once at startup
                self.stats.write().detector_errors += 1;
                debug!(worker_id = self.id, camera_id = %camera_id, reason = %reason, "No object model, frame skipped");
                Vec::new()
            }
            Err(e) => {
                self.stats.write().detector_errors += 1;
                warn!(worker_id = self.id, camera_id = %camera_id, error = %e, "Object detection failed");
                Vec::new()
            }
        };

        self.stats.write().tasks_processed += 1;

        if detections.is_empty() {
            debug!(worker_id = self.id, camera_id = %camera_id, "No objects detected");
            return;
        }

        self.stats.write().frames_with_detections += 1;
        metrics::counter!("watchpost.detections.frames").increment(1);

        let labels: Vec<&str> = detections.iter().map(|d| d.label.as_str()).collect();
        info!(worker_id = self.id, camera_id = %camera_id, objects = ?labels, "Objects detected");

        let image = match self.detector.annotate(&frame, &detections) {
            Ok(annotated) => annotated,
            Err(e) => {
                self.stats.write().annotation_fallbacks += 1;
                warn!(worker_id = self.id, camera_id = %camera_id, error = %e, "Annotation failed, keeping original frame");
                frame
            }
        };

        self.buffer.add(image, &camera_id, detections);
    }
}
