//! Frame differencing detector built on the `image` crate.

use super::{Detection, Detector, DetectorError};
use crate::config::DetectorConfig;
use crate::registry::CameraRegistry;
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use parking_lot::Mutex;
use std::io::Cursor;
use tracing::{debug, info};

const ANNOTATION_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Motion baseline for a single camera.
#[derive(Default)]
pub struct CameraMotionState {
    previous: Option<GrayImage>,
}

impl CameraMotionState {
    /// Whether a baseline frame has been recorded.
    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }
}

/// Object detection backend plugged into a `FrameDiffDetector`.
pub trait ObjectModel: Send + Sync {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector that gates on grayscale frame differences.
pub struct FrameDiffDetector {
    pixel_threshold: u8,
    min_changed_pixels: u64,
    min_confidence: f32,
    states: CameraRegistry<Mutex<CameraMotionState>>,
    model: Option<Box<dyn ObjectModel>>,
}

impl FrameDiffDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            pixel_threshold: config.motion_pixel_threshold,
            min_changed_pixels: config.motion_min_changed_pixels,
            min_confidence: config.min_confidence,
            states: CameraRegistry::new(),
            model: None,
        }
    }

    /// Attach an object detection backend.
    pub fn with_model(mut self, model: Box<dyn ObjectModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Number of cameras with a motion baseline.
    pub fn tracked_cameras(&self) -> usize {
        self.states.len()
    }

    fn count_changed(&self, previous: &GrayImage, current: &GrayImage) -> u64 {
        previous
            .as_raw()
            .iter()
            .zip(current.as_raw())
            .filter(|(a, b)| a.abs_diff(**b) > self.pixel_threshold)
            .count() as u64
    }
}

fn decode(frame: &[u8]) -> Result<DynamicImage, DetectorError> {
    let image = image::load_from_memory(frame).map_err(|e| DetectorError::Decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(DetectorError::EmptyImage);
    }
    Ok(image)
}

fn encode_jpeg(image: RgbImage) -> Result<Vec<u8>, DetectorError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| DetectorError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

impl Detector for FrameDiffDetector {
    fn detect_motion(&self, frame: &[u8], camera_id: &str) -> Result<bool, DetectorError> {
        let current = decode(frame)?.to_luma8();

        let state = self.states.get_or_create(camera_id);
        let mut state = state.lock();

        let changed = match &state.previous {
            Some(previous) if previous.dimensions() == current.dimensions() => {
                Some(self.count_changed(previous, &current))
            }
            Some(_) => {
                debug!(camera_id = %camera_id, "Frame size changed, resetting motion baseline");
                None
            }
            None => {
                info!(camera_id = %camera_id, "Initialized motion detection");
                None
            }
        };

        state.previous = Some(current);

        let Some(changed) = changed else {
            return Ok(false);
        };

        let motion = changed > self.min_changed_pixels;
        if motion {
            debug!(camera_id = %camera_id, changed_pixels = changed, "Motion detected");
        }
        Ok(motion)
    }

    fn detect_objects(&self, frame: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let model = self.model.as_ref().ok_or_else(|| {
            DetectorError::ModelUnavailable("no object model attached".to_string())
        })?;

        let image = decode(frame)?.to_rgb8();
        let detections = model
            .infer(&image)?
            .into_iter()
            .filter(|d| d.confidence > self.min_confidence)
            .collect();

        Ok(detections)
    }

    fn annotate(&self, frame: &[u8], detections: &[Detection]) -> Result<Vec<u8>, DetectorError> {
        let mut image = decode(frame)?.to_rgb8();

        for detection in detections {
            if detection.width <= 0 || detection.height <= 0 {
                continue;
            }
            let outer = Rect::at(detection.x, detection.y)
                .of_size(detection.width as u32, detection.height as u32);
            draw_hollow_rect_mut(&mut image, outer, ANNOTATION_COLOR);

            // second pass for a 2px outline
            if detection.width > 2 && detection.height > 2 {
                let inner = Rect::at(detection.x + 1, detection.y + 1)
                    .of_size(detection.width as u32 - 2, detection.height as u32 - 2);
                draw_hollow_rect_mut(&mut image, inner, ANNOTATION_COLOR);
            }
        }

        encode_jpeg(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            motion_pixel_threshold: 30,
            motion_min_changed_pixels: 500,
            min_confidence: 0.6,
            model_path: None,
            model_input_size: 640,
            iou_threshold: 0.45,
            class_labels: Vec::new(),
        }
    }

    fn jpeg(width: u32, height: u32, square: Option<(u32, u32, u32)>) -> Vec<u8> {
        let mut image = RgbImage::from_pixel(width, height, Rgb([40, 40, 40]));
        if let Some((x0, y0, size)) = square {
            for y in y0..(y0 + size).min(height) {
                for x in x0..(x0 + size).min(width) {
                    image.put_pixel(x, y, Rgb([250, 250, 250]));
                }
            }
        }
        encode_jpeg(image).unwrap()
    }

    struct FixedModel(Vec<Detection>);

    impl ObjectModel for FixedModel {
        fn infer(&self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_first_frame_has_no_motion() {
        let detector = FrameDiffDetector::new(&config());
        let frame = jpeg(64, 64, Some((8, 8, 40)));

        assert!(!detector.detect_motion(&frame, "brama").unwrap());
        assert_eq!(detector.tracked_cameras(), 1);
    }

    #[test]
    fn test_identical_frames_have_no_motion() {
        let detector = FrameDiffDetector::new(&config());
        let frame = jpeg(64, 64, None);

        detector.detect_motion(&frame, "brama").unwrap();
        assert!(!detector.detect_motion(&frame, "brama").unwrap());
    }

    #[test]
    fn test_large_change_is_motion() {
        let detector = FrameDiffDetector::new(&config());

        detector.detect_motion(&jpeg(64, 64, None), "brama").unwrap();
        assert!(detector
            .detect_motion(&jpeg(64, 64, Some((8, 8, 40))), "brama")
            .unwrap());
    }

    #[test]
    fn test_cameras_do_not_share_baselines() {
        let detector = FrameDiffDetector::new(&config());
        let dark = jpeg(64, 64, None);
        let bright = jpeg(64, 64, Some((8, 8, 40)));

        detector.detect_motion(&dark, "brama").unwrap();
        // first frame for drzwi, must not be diffed against brama's baseline
        assert!(!detector.detect_motion(&bright, "drzwi").unwrap());
        assert!(!detector.detect_motion(&dark, "brama").unwrap());
        assert!(!detector.detect_motion(&bright, "drzwi").unwrap());
    }

    #[test]
    fn test_size_change_resets_baseline() {
        let detector = FrameDiffDetector::new(&config());

        detector.detect_motion(&jpeg(64, 64, None), "brama").unwrap();
        assert!(!detector
            .detect_motion(&jpeg(32, 32, Some((0, 0, 32))), "brama")
            .unwrap());
    }

    #[test]
    fn test_garbage_frame_is_decode_error() {
        let detector = FrameDiffDetector::new(&config());
        assert!(matches!(
            detector.detect_motion(b"not a jpeg", "brama"),
            Err(DetectorError::Decode(_))
        ));
    }

    #[test]
    fn test_detect_objects_without_model() {
        let detector = FrameDiffDetector::new(&config());
        assert!(matches!(
            detector.detect_objects(&jpeg(16, 16, None)),
            Err(DetectorError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_detect_objects_filters_low_confidence() {
        let detector = FrameDiffDetector::new(&config()).with_model(Box::new(FixedModel(vec![
            Detection::new("osoba", 0.9, 1, 1, 10, 10),
            Detection::new("pies", 0.3, 1, 1, 10, 10),
        ])));

        let detections = detector.detect_objects(&jpeg(16, 16, None)).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "osoba");
    }

    #[test]
    fn test_annotate_produces_decodable_jpeg() {
        let detector = FrameDiffDetector::new(&config());
        let frame = jpeg(64, 64, None);
        let detections = vec![
            Detection::new("osoba", 0.9, 4, 4, 30, 30),
            Detection::new("empty", 0.9, 4, 4, 0, 0),
            Detection::new("outside", 0.9, 60, 60, 30, 30),
        ];

        let annotated = detector.annotate(&frame, &detections).unwrap();
        let decoded = image::load_from_memory(&annotated).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 64));

        // top edge of the box leans red, the untouched background stays gray
        let redness = |y: u32| -> i32 {
            (4..34)
                .map(|x| {
                    let p = decoded.get_pixel(x, y);
                    p[0] as i32 - p[1] as i32
                })
                .sum::<i32>()
                / 30
        };
        assert!(redness(4) > 30);
        assert!(redness(50).abs() < 15);
    }
}
