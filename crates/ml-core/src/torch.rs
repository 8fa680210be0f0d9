use std::{convert::TryFrom, path::Path};

use anyhow::Result;
use image::{
    RgbImage,
    imageops::{self, FilterType},
};
use tch::{self, CModule, Device, Kind, Tensor};

use crate::{
    detector::{Detection, DetectorError, DetectorOutput, ObjectDetector, non_max_suppression},
    labels::{COCO_LABELS, label_for},
};

/// TorchScript YOLOv8 export (`yolo export format=torchscript`).
///
/// The module is expected to emit `[1, 4 + classes, anchors]` with boxes as
/// centre/size in detector-input pixels followed by per-class scores.
pub struct YoloDetector {
    module: CModule,
    device: Device,
    input_size: (u32, u32),
    min_score: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl YoloDetector {
    /// Load a TorchScript module onto `device`.
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device, input_size: (u32, u32)) -> Result<Self> {
        let module = CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            min_score: 0.25,
            iou_threshold: 0.45,
            labels: COCO_LABELS.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Override the score below which candidates are dropped before NMS.
    pub fn with_min_score(mut self, score: f32) -> Self {
        self.min_score = score;
        self
    }

    /// Replace the COCO label table for custom checkpoints.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn to_tensor(&self, frame: &RgbImage) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let resized = imageops::resize(frame, in_w, in_h, FilterType::Triangle);
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }

    fn decode(&self, output: &Tensor, frame_w: u32, frame_h: u32) -> Result<Vec<Detection>, DetectorError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectorError::Inference(anyhow::anyhow!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectorError::Inference(err.into()))?;

        let scale_x = frame_w as f32 / self.input_size.0 as f32;
        let scale_y = frame_h as f32 / self.input_size.1 as f32;
        let max_x = frame_w.saturating_sub(1) as f32;
        let max_y = frame_h.saturating_sub(1) as f32;

        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.min_score {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];
            candidates.push(Detection {
                bbox,
                label: label_for(class_id, &self.labels),
                score,
            });
            if candidates.len() >= 512 {
                break;
            }
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<DetectorOutput, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectorError::InvalidInput("empty frame".into()));
        }
        let input = self.to_tensor(frame);
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| DetectorError::Inference(err.into()))?;
        let detections = self.decode(&output, frame.width(), frame.height())?;
        Ok(DetectorOutput::from_detections(detections))
    }

    fn name(&self) -> &str {
        "yolov8-torchscript"
    }
}
