//! YOLOv8 object model on ONNX Runtime.
//!
//! Expects the stock single-output export: input `[1, 3, S, S]` in RGB scaled
//! to 0..1, output `[1, 4 + classes, anchors]` with center/size boxes in
//! input pixels followed by one score per class.

use super::{Detection, DetectorError, ObjectModel};
use crate::config::DetectorConfig;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array4, ArrayView3, Ix3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use tracing::{debug, info};

/// Fill value for the unused part of the letterboxed input.
const PAD_VALUE: f32 = 144.0 / 255.0;

const CXYWH_OFFSET: usize = 4;

/// COCO class names for the classes cameras care about; everything else is
/// reported as `nieznany<id>`.
const DEFAULT_LABELS: &[(usize, &str)] = &[
    (0, "osoba"),
    (1, "rower"),
    (2, "samochod"),
    (3, "motocykl"),
    (4, "samolot"),
    (5, "autobus"),
    (7, "ciezarowka"),
    (14, "ptak"),
    (15, "kot"),
    (16, "pies"),
];

/// Object model backed by an ONNX Runtime session.
pub struct OnnxModel {
    session: Session,
    input_size: u32,
    score_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl OnnxModel {
    /// Load the model at `path` with one intra-op thread, since every
    /// worker owns its own session.
    pub fn load(path: &Path, config: &DetectorConfig) -> Result<Self, DetectorError> {
        if !path.is_file() {
            return Err(DetectorError::ModelUnavailable(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(1))
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| DetectorError::ModelUnavailable(format!("{}: {}", path.display(), e)))?;

        info!(
            model = %path.display(),
            input_size = config.model_input_size,
            "Object detection model loaded"
        );

        Ok(Self {
            session,
            input_size: config.model_input_size,
            score_threshold: config.min_confidence,
            iou_threshold: config.iou_threshold,
            labels: config.class_labels.clone(),
        })
    }
}

impl ObjectModel for OnnxModel {
    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, scale) = preprocess(image, self.input_size);

        let inputs = ort::inputs![input.view()].map_err(|e| DetectorError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let output = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Inference(e.to_string()))?;
        let output = output
            .into_dimensionality::<Ix3>()
            .map_err(|e| DetectorError::Inference(format!("unexpected output shape: {}", e)))?;

        let detections = decode_predictions(
            output,
            scale,
            image.dimensions(),
            self.score_threshold,
            self.iou_threshold,
            &self.labels,
        );
        debug!(detections = detections.len(), "Inference completed");
        Ok(detections)
    }
}

/// Resize `image` into the top-left corner of a square `size` input tensor,
/// keeping the aspect ratio. Returns the tensor and the applied scale.
pub(crate) fn preprocess(image: &RgbImage, size: u32) -> (Array4<f32>, f32) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(image, new_width, new_height, FilterType::Triangle);

    let mut input = Array4::from_elem((1, 3, size as usize, size as usize), PAD_VALUE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = r as f32 / 255.0;
        input[[0, 1, y, x]] = g as f32 / 255.0;
        input[[0, 2, y, x]] = b as f32 / 255.0;
    }

    (input, scale)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    class_id: usize,
    score: f32,
}

impl Candidate {
    fn iou(&self, other: &Candidate) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.width * self.height + other.width * other.height - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Turn raw YOLOv8 output into detections in original image pixels.
pub(crate) fn decode_predictions(
    output: ArrayView3<f32>,
    scale: f32,
    (width, height): (u32, u32),
    score_threshold: f32,
    iou_threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    let (_, rows, anchors) = output.dim();
    if rows <= CXYWH_OFFSET || scale <= 0.0 {
        return Vec::new();
    }

    let (width, height) = (width as f32, height as f32);
    let mut candidates = Vec::new();

    for anchor in 0..anchors {
        let mut best = (0, f32::MIN);
        for class_id in 0..rows - CXYWH_OFFSET {
            let score = output[[0, CXYWH_OFFSET + class_id, anchor]];
            if score > best.1 {
                best = (class_id, score);
            }
        }
        if best.1 < score_threshold {
            continue;
        }

        let cx = output[[0, 0, anchor]] / scale;
        let cy = output[[0, 1, anchor]] / scale;
        let w = output[[0, 2, anchor]] / scale;
        let h = output[[0, 3, anchor]] / scale;

        let x = (cx - w / 2.0).clamp(0.0, width);
        let y = (cy - h / 2.0).clamp(0.0, height);
        candidates.push(Candidate {
            x,
            y,
            width: w.min(width - x),
            height: h.min(height - y),
            class_id: best.0,
            score: best.1,
        });
    }

    non_max_suppression(&mut candidates, iou_threshold);

    candidates
        .into_iter()
        .map(|c| {
            Detection::new(
                class_label(labels, c.class_id),
                c.score,
                c.x.round() as i32,
                c.y.round() as i32,
                c.width.round() as i32,
                c.height.round() as i32,
            )
        })
        .collect()
}

/// Keep the highest scoring box of every overlapping group.
fn non_max_suppression(candidates: &mut Vec<Candidate>, iou_threshold: f32) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates.drain(..) {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    *candidates = kept;
}

/// Label for `class_id`, from the configured list or the built-in table.
pub(crate) fn class_label(labels: &[String], class_id: usize) -> String {
    if !labels.is_empty() {
        return labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("nieznany{}", class_id));
    }

    DEFAULT_LABELS
        .iter()
        .find(|(id, _)| *id == class_id)
        .map(|(_, label)| label.to_string())
        .unwrap_or_else(|| format!("nieznany{}", class_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array3;

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

    /// Output with three classes; each entry is (cx, cy, w, h, scores).
    fn output(anchors: &[(f32, f32, f32, f32, [f32; 3])]) -> Array3<f32> {
        let mut output = Array3::zeros((1, CXYWH_OFFSET + 3, anchors.len()));
        for (i, (cx, cy, w, h, scores)) in anchors.iter().enumerate() {
            output[[0, 0, i]] = *cx;
            output[[0, 1, i]] = *cy;
            output[[0, 2, i]] = *w;
            output[[0, 3, i]] = *h;
            for (class_id, score) in scores.iter().enumerate() {
                output[[0, CXYWH_OFFSET + class_id, i]] = *score;
            }
        }
        output
    }

    #[test]
    fn test_load_missing_model() {
        let result = OnnxModel::load(Path::new("/nonexistent/yolov8n.onnx"), &config());
        assert!(matches!(result, Err(DetectorError::ModelUnavailable(_))));
    }

    #[test]
    fn test_preprocess_keeps_aspect_ratio() {
        let image = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));
        let (input, scale) = preprocess(&image, 64);

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((scale - 0.64).abs() < 1e-6);

        // resized content is 64x32 in the top-left corner
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-6);
        assert!((input[[0, 0, 40, 10]] - PAD_VALUE).abs() < 1e-6);
    }

    #[test]
    fn test_decode_scales_filters_and_suppresses() {
        let output = output(&[
            // person, kept
            (50.0, 50.0, 20.0, 40.0, [0.9, 0.1, 0.0]),
            // overlapping weaker person, suppressed
            (52.0, 50.0, 20.0, 40.0, [0.7, 0.0, 0.0]),
            // below threshold
            (150.0, 150.0, 10.0, 10.0, [0.3, 0.2, 0.1]),
            // car elsewhere
            (200.0, 100.0, 60.0, 30.0, [0.0, 0.0, 0.8]),
        ]);

        let detections = decode_predictions(output.view(), 0.5, (640, 480), 0.6, 0.45, &[]);

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0], Detection::new("osoba", 0.9, 80, 60, 40, 80));
        assert_eq!(detections[1].label, "samochod");
        assert_eq!(
            (detections[1].x, detections[1].y, detections[1].width, detections[1].height),
            (340, 170, 120, 60)
        );
    }

    #[test]
    fn test_decode_clamps_to_image() {
        let output = output(&[(5.0, 5.0, 20.0, 20.0, [0.95, 0.0, 0.0])]);
        let detections = decode_predictions(output.view(), 1.0, (100, 100), 0.6, 0.45, &[]);

        assert_eq!(detections.len(), 1);
        assert_eq!((detections[0].x, detections[0].y), (0, 0));
        assert!(detections[0].width <= 100);
    }

    #[test]
    fn test_decode_rejects_malformed_output() {
        let output = Array3::<f32>::zeros((1, 4, 10));
        assert!(decode_predictions(output.view(), 1.0, (100, 100), 0.1, 0.45, &[]).is_empty());
    }

    #[test]
    fn test_class_labels() {
        assert_eq!(class_label(&[], 16), "pies");
        assert_eq!(class_label(&[], 42), "nieznany42");

        let labels = vec!["person".to_string(), "bicycle".to_string()];
        assert_eq!(class_label(&labels, 1), "bicycle");
        assert_eq!(class_label(&labels, 2), "nieznany2");
    }
}
