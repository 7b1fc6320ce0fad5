use ndarray::{Array4, ArrayView3, ArrayViewD, Ix3};
use opencv::core::Mat;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ClassMap, DetectorConfig};

const YOLO_INPUT_SIZE: u32 = 640;
const MAX_DETECTIONS: usize = 300;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model error: {0}")]
    Model(String),
    #[error("bad frame: {0}")]
    Frame(String),
}

impl From<ort::Error> for InferenceError {
    fn from(e: ort::Error) -> Self {
        InferenceError::Model(e.to_string())
    }
}

impl From<opencv::Error> for InferenceError {
    fn from(e: opencv::Error) -> Self {
        InferenceError::Frame(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ClassLabel {
    Person,
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl ClassLabel {
    pub const ALL: [ClassLabel; 6] = [
        ClassLabel::Person,
        ClassLabel::Bicycle,
        ClassLabel::Car,
        ClassLabel::Motorcycle,
        ClassLabel::Bus,
        ClassLabel::Truck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClassLabel::Person => "Person",
            ClassLabel::Bicycle => "Bicycle",
            ClassLabel::Car => "Car",
            ClassLabel::Motorcycle => "Motorcycle",
            ClassLabel::Bus => "Bus",
            ClassLabel::Truck => "Truck",
        }
    }

    /// Classes that contribute to the traffic state.
    pub fn is_vehicle(self) -> bool {
        matches!(
            self,
            ClassLabel::Car | ClassLabel::Bus | ClassLabel::Truck | ClassLabel::Motorcycle
        )
    }

    pub fn from_model_id(map: ClassMap, id: usize) -> Option<Self> {
        match map {
            ClassMap::Traffic => Self::ALL.get(id).copied(),
            ClassMap::Coco => match id {
                0 => Some(ClassLabel::Person),
                1 => Some(ClassLabel::Bicycle),
                2 => Some(ClassLabel::Car),
                3 => Some(ClassLabel::Motorcycle),
                5 => Some(ClassLabel::Bus),
                7 => Some(ClassLabel::Truck),
                _ => None,
            },
        }
    }
}

/// Axis-aligned box in pixel space, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.w, self.h)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_label: ClassLabel,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Image in, detections out. Implementations keep no per-frame state.
pub trait Detector: Send {
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>, InferenceError>;
}

pub struct ObjectDetector {
    session: Session,
    confidence_threshold: f32,
    nms_iou: f32,
    class_map: ClassMap,
}

impl ObjectDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, InferenceError> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?;

        let model_path = config.model_path.as_str();
        let session = if model_path.starts_with("http://") || model_path.starts_with("https://") {
            builder.commit_from_url(model_path)?
        } else {
            builder.commit_from_file(model_path)?
        };

        tracing::info!(model = %model_path, class_map = ?config.class_map, "detector loaded");

        Ok(Self {
            session,
            confidence_threshold: config.confidence_threshold,
            nms_iou: config.nms_iou,
            class_map: config.class_map,
        })
    }

    fn preprocess(&self, frame: &Mat) -> Result<(Array4<f32>, Letterbox), InferenceError> {
        use opencv::core::{Size, BORDER_CONSTANT};
        use opencv::imgproc;
        use opencv::prelude::*;

        let rows = frame.rows() as f32;
        let cols = frame.cols() as f32;
        let input_size = YOLO_INPUT_SIZE as f32;

        let scale = (input_size / cols).min(input_size / rows);
        let new_w = (cols * scale).round() as i32;
        let new_h = (rows * scale).round() as i32;

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(new_w, new_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let pad_x = ((input_size as i32 - new_w) / 2) as f32;
        let pad_y = ((input_size as i32 - new_h) / 2) as f32;

        let mut padded = Mat::default();
        opencv::core::copy_make_border(
            &resized,
            &mut padded,
            pad_y as i32,
            input_size as i32 - new_h - pad_y as i32,
            pad_x as i32,
            input_size as i32 - new_w - pad_x as i32,
            BORDER_CONSTANT,
            opencv::core::Scalar::new(114.0, 114.0, 114.0, 0.0),
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        let data = rgb.data_bytes()?;
        let side = YOLO_INPUT_SIZE as usize;
        if data.len() < side * side * 3 {
            return Err(InferenceError::Frame("frame data too small".to_string()));
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for y in 0..side {
            for x in 0..side {
                let idx = (y * side + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        Ok((
            tensor,
            Letterbox {
                scale,
                pad_x,
                pad_y,
                orig_w: cols,
                orig_h: rows,
            },
        ))
    }
}

impl Detector for ObjectDetector {
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>, InferenceError> {
        use opencv::prelude::*;

        if frame.rows() == 0 || frame.cols() == 0 || frame.channels() != 3 {
            return Err(InferenceError::Frame(format!(
                "expected non-empty BGR frame, got {}x{}x{}",
                frame.cols(),
                frame.rows(),
                frame.channels()
            )));
        }

        let (input_tensor, letterbox) = self.preprocess(frame)?;
        let tensor_ref = TensorRef::from_array_view(input_tensor.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;

        let candidates = if let (Some(logits_val), Some(boxes_val)) =
            (outputs.get("logits"), outputs.get("pred_boxes"))
        {
            // End-to-end export: per-query logits plus normalised boxes, no NMS needed.
            let logits = logits_val.try_extract_array::<f32>()?.to_owned();
            let boxes = boxes_val.try_extract_array::<f32>()?.to_owned();
            drop(outputs);
            decode_query_outputs(
                &logits.view(),
                &boxes.view(),
                self.confidence_threshold,
                self.class_map,
                &letterbox,
            )?
        } else if let Some(raw) = outputs.get("output0") {
            // Anchor-free export: [1, 4 + classes, anchors], needs NMS.
            let raw = raw.try_extract_array::<f32>()?.to_owned();
            drop(outputs);
            let raw = raw
                .into_dimensionality::<Ix3>()
                .map_err(|e| InferenceError::Model(format!("unexpected output0 shape: {e}")))?;
            let decoded =
                decode_anchor_outputs(&raw.view(), self.confidence_threshold, self.class_map, &letterbox);
            non_max_suppression(decoded, self.nms_iou)
        } else {
            return Err(InferenceError::Model(
                "unsupported model: expected 'logits'+'pred_boxes' or 'output0'".to_string(),
            ));
        };

        Ok(candidates)
    }
}

/// Maps model input space back to the original frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    orig_w: f32,
    orig_h: f32,
}

impl Letterbox {
    /// `(cx, cy, w, h)` in input pixels to a clamped frame box.
    fn unproject(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let x = ((cx - w / 2.0) - self.pad_x) / self.scale;
        let y = ((cy - h / 2.0) - self.pad_y) / self.scale;
        let x = x.clamp(0.0, self.orig_w);
        let y = y.clamp(0.0, self.orig_h);
        let w = (w / self.scale).min(self.orig_w - x);
        let h = (h / self.scale).min(self.orig_h - y);
        BoundingBox::new(x, y, w, h)
    }
}

fn decode_query_outputs(
    logits: &ArrayViewD<f32>,
    boxes: &ArrayViewD<f32>,
    confidence_threshold: f32,
    class_map: ClassMap,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, InferenceError> {
    let logits_shape = logits.shape();
    if logits_shape.len() < 2 || boxes.shape().len() < 2 {
        return Ok(Vec::new());
    }

    // Expected shapes: logits [1, queries, classes], boxes [1, queries, 4]
    let (num_queries, num_classes) = if logits_shape.len() == 3 {
        (logits_shape[1], logits_shape[2])
    } else {
        (logits_shape[0], logits_shape[1])
    };

    let logits_flat = logits
        .as_slice()
        .ok_or_else(|| InferenceError::Model("non-contiguous logits".to_string()))?;
    let boxes_flat = boxes
        .as_slice()
        .ok_or_else(|| InferenceError::Model("non-contiguous boxes".to_string()))?;
    if boxes_flat.len() < num_queries * 4 {
        return Err(InferenceError::Model("box output shorter than logits".to_string()));
    }

    let input_size = YOLO_INPUT_SIZE as f32;
    let mut detections = Vec::new();

    for i in 0..num_queries {
        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for j in 0..num_classes {
            let score = sigmoid(logits_flat[i * num_classes + j]);
            if score > best_score {
                best_score = score;
                best_class = j;
            }
        }

        if best_score < confidence_threshold {
            continue;
        }
        let Some(class_label) = ClassLabel::from_model_id(class_map, best_class) else {
            continue;
        };

        let cx = boxes_flat[i * 4] * input_size;
        let cy = boxes_flat[i * 4 + 1] * input_size;
        let w = boxes_flat[i * 4 + 2] * input_size;
        let h = boxes_flat[i * 4 + 3] * input_size;

        detections.push(Detection {
            class_label,
            bbox: letterbox.unproject(cx, cy, w, h),
            confidence: best_score,
        });
    }

    Ok(detections)
}

fn decode_anchor_outputs(
    raw: &ArrayView3<f32>,
    confidence_threshold: f32,
    class_map: ClassMap,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let (_, channels, anchors) = raw.dim();
    if channels <= 4 {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for i in 0..anchors {
        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for c in 4..channels {
            let score = raw[[0, c, i]];
            if score > best_score {
                best_score = score;
                best_class = c - 4;
            }
        }

        if best_score < confidence_threshold {
            continue;
        }
        let Some(class_label) = ClassLabel::from_model_id(class_map, best_class) else {
            continue;
        };

        detections.push(Detection {
            class_label,
            bbox: letterbox.unproject(raw[[0, 0, i]], raw[[0, 1, i]], raw[[0, 2, i]], raw[[0, 3, i]]),
            confidence: best_score,
        });
    }
    detections
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::new();
    'outer: for d in detections {
        for k in &kept {
            if k.class_label == d.class_label && k.bbox.iou(&d.bbox) > iou_threshold {
                continue 'outer;
            }
        }
        kept.push(d);
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
    }
    kept
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
