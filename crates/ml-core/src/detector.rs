use image::RgbImage;
use thiserror::Error;

/// Single labelled detection in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[left, top, right, bottom]`.
    pub bbox: [f32; 4],
    pub label: String,
    /// Confidence in `0.0..=1.0`.
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f32, bbox: [f32; 4]) -> Self {
        Self {
            bbox,
            label: label.into(),
            score,
        }
    }
}

/// Everything a detector produced for one frame.
#[derive(Debug, Clone, Default)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    /// Detector-rendered visualisation of the frame, when the backend draws
    /// its own overlays.
    pub annotated: Option<RgbImage>,
}

impl DetectorOutput {
    pub fn from_detections(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            annotated: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector rejected frame: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(#[source] anyhow::Error),
}

/// Black-box object detector run once per frame.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<DetectorOutput, DetectorError>;

    fn name(&self) -> &str;
}

/// Detector used when no model is configured; it never reports anything.
#[derive(Debug, Default)]
pub struct NoopDetector;

impl ObjectDetector for NoopDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<DetectorOutput, DetectorError> {
        Ok(DetectorOutput::default())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Intersection over union of two `[left, top, right, bottom]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = a[2].min(b[2]);
    let bottom = a[3].min(b[3]);
    let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Greedy per-label non-maximum suppression, highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.label == candidate.label && iou(&existing.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
