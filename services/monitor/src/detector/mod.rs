//! Detector contract consumed by the pipeline.
//!
//! The pipeline never talks to a vision library directly. The dispatcher
//! holds one detector for motion gating and every worker owns its own
//! detector for object detection and annotation.

mod diff;
mod onnx;

pub use diff::{CameraMotionState, FrameDiffDetector, ObjectModel};
pub use onnx::OnnxModel;

use crate::config::DetectorConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur inside a detector.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Decoded image is empty")]
    EmptyImage,

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Detection model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// A single labeled, located, confidence-scored object found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Object class label
    pub label: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Bounding box left edge in pixels
    pub x: i32,
    /// Bounding box top edge in pixels
    pub y: i32,
    /// Bounding box width in pixels
    pub width: i32,
    /// Bounding box height in pixels
    pub height: i32,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            x,
            y,
            width,
            height,
        }
    }
}

/// Machine-vision backend used by the pipeline.
///
/// Implementations keep whatever per-camera state they need for
/// `detect_motion` and must serialize calls for the same camera, so that
/// consecutive frames are always diffed against their own predecessor.
pub trait Detector: Send + Sync {
    /// Report whether `frame` differs enough from the previous frame of
    /// `camera_id`. The first frame ever seen for a camera reports `false`.
    fn detect_motion(&self, frame: &[u8], camera_id: &str) -> Result<bool, DetectorError>;

    /// Run object detection on an encoded frame.
    fn detect_objects(&self, frame: &[u8]) -> Result<Vec<Detection>, DetectorError>;

    /// Draw `detections` onto `frame` and return the re-encoded image.
    fn annotate(&self, frame: &[u8], detections: &[Detection]) -> Result<Vec<u8>, DetectorError>;
}

/// Build one detector per worker.
///
/// With a configured model every detector loads its own session, so
/// workers never share inference state.
pub fn worker_detectors(config: &DetectorConfig, count: usize) -> Result<Vec<Box<dyn Detector>>, DetectorError> {
    (0..count)
        .map(|_| {
            let detector = FrameDiffDetector::new(config);
            let detector = match &config.model_path {
                Some(path) => detector.with_model(Box::new(OnnxModel::load(path, config)?)),
                None => detector,
            };
            Ok(Box::new(detector) as Box<dyn Detector>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_detectors_without_model() {
        let detectors = worker_detectors(&DetectorConfig::default(), 3).unwrap();
        assert_eq!(detectors.len(), 3);
        assert!(matches!(
            detectors[0].detect_objects(b"not an image"),
            Err(DetectorError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_worker_detectors_missing_model_fails() {
        let config = DetectorConfig {
            model_path: Some("/nonexistent/yolov8n.onnx".into()),
            ..DetectorConfig::default()
        };
        assert!(matches!(
            worker_detectors(&config, 2),
            Err(DetectorError::ModelUnavailable(_))
        ));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted detector for pipeline tests.

    use super::{Detection, Detector, DetectorError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Shared call log of a `FakeDetector`.
    #[derive(Default)]
    pub struct FakeCalls {
        pub motion: AtomicUsize,
        pub objects: AtomicUsize,
        pub annotate: AtomicUsize,
        pub motion_cameras: Mutex<Vec<String>>,
    }

    /// Detector returning queued results, falling back to fixed defaults.
    pub struct FakeDetector {
        motion: Mutex<VecDeque<Result<bool, DetectorError>>>,
        default_motion: bool,
        objects: Mutex<VecDeque<Result<Vec<Detection>, DetectorError>>>,
        default_objects: Vec<Detection>,
        fail_annotate: bool,
        detect_delay: Option<Duration>,
        pub calls: Arc<FakeCalls>,
    }

    impl FakeDetector {
        pub fn new() -> Self {
            Self {
                motion: Mutex::new(VecDeque::new()),
                default_motion: false,
                objects: Mutex::new(VecDeque::new()),
                default_objects: Vec::new(),
                fail_annotate: false,
                detect_delay: None,
                calls: Arc::new(FakeCalls::default()),
            }
        }

        pub fn always_motion(mut self) -> Self {
            self.default_motion = true;
            self
        }

        pub fn with_motion(self, result: Result<bool, DetectorError>) -> Self {
            self.motion.lock().push_back(result);
            self
        }

        pub fn always_detect(mut self, detections: Vec<Detection>) -> Self {
            self.default_objects = detections;
            self
        }

        pub fn with_objects(self, result: Result<Vec<Detection>, DetectorError>) -> Self {
            self.objects.lock().push_back(result);
            self
        }

        pub fn failing_annotate(mut self) -> Self {
            self.fail_annotate = true;
            self
        }

        pub fn slow(mut self, delay: Duration) -> Self {
            self.detect_delay = Some(delay);
            self
        }
    }

    impl Detector for FakeDetector {
        fn detect_motion(&self, _frame: &[u8], camera_id: &str) -> Result<bool, DetectorError> {
            self.calls.motion.fetch_add(1, Ordering::SeqCst);
            self.calls.motion_cameras.lock().push(camera_id.to_string());
            self.motion
                .lock()
                .pop_front()
                .unwrap_or(Ok(self.default_motion))
        }

        fn detect_objects(&self, _frame: &[u8]) -> Result<Vec<Detection>, DetectorError> {
            if let Some(delay) = self.detect_delay {
                std::thread::sleep(delay);
            }
            self.calls.objects.fetch_add(1, Ordering::SeqCst);
            self.objects
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(self.default_objects.clone()))
        }

        fn annotate(&self, frame: &[u8], _detections: &[Detection]) -> Result<Vec<u8>, DetectorError> {
            self.calls.annotate.fetch_add(1, Ordering::SeqCst);
            if self.fail_annotate {
                return Err(DetectorError::Encode("scripted failure".to_string()));
            }
            let mut annotated = frame.to_vec();
            annotated.extend_from_slice(b"+annotated");
            Ok(annotated)
        }
    }
}
