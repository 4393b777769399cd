//! Core data types shared across the inference pipeline.
//!
//! Configuration and result types serialise to JSON; `InferTask` is an
//! internal queue element and never crosses the wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collector::ResultAggregator;

/// Detector family a model artifact belongs to. Selects the post-processing
/// decode path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Anchor-based, three output heads at strides 8/16/32.
    #[default]
    Yolov5,
    /// Anchor-free with DFL box regression, three output heads.
    Yolov8,
    /// Anchor-free fused single-output layout `[1, 4 + C, 8400]`.
    Yolov11,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Yolov5 => "yolov5",
            ModelKind::Yolov8 => "yolov8",
            ModelKind::Yolov11 => "yolov11",
        }
    }
}

fn default_input_dim() -> u32 {
    640
}

fn default_conf_threshold() -> f32 {
    0.25
}

fn default_nms_threshold() -> f32 {
    0.45
}

/// Per-model configuration attached to a stream. Immutable once attached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the model artifact on disk.
    pub model_path: String,
    /// Task label carried through to published results.
    pub task_name: String,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default = "default_input_dim")]
    pub input_width: u32,
    #[serde(default = "default_input_dim")]
    pub input_height: u32,
    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    /// Optional class labels file, one label per line.
    #[serde(default)]
    pub labels_file: Option<String>,
}

/// Axis-aligned box in original-image coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One detected object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Output of one model over one frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelResult {
    pub task_name: String,
    pub model_path: String,
    /// Inference plus post-processing, milliseconds.
    pub inference_time_ms: f64,
    pub detections: Vec<Detection>,
}

/// Aggregated result for one frame: one `ModelResult` per configured model.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FrameResult {
    pub cam_id: String,
    pub source_url: String,
    pub frame_id: u64,
    pub timestamp_ms: i64,
    pub pts: i64,
    pub original_width: u32,
    pub original_height: u32,
    pub results: Vec<ModelResult>,
}

/// One unit of accelerator work: a single (frame, model) pairing.
///
/// Consumed by exactly one worker. Tasks dropped at the queue boundary
/// produce no `ModelResult`.
#[derive(Clone)]
pub struct InferTask {
    pub cam_id: String,
    pub source_url: String,
    pub frame_id: u64,
    pub pts: i64,
    pub timestamp_ms: i64,
    pub original_width: u32,
    pub original_height: u32,

    pub model_path: String,
    pub task_name: String,
    pub kind: ModelKind,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub labels: Arc<Vec<String>>,

    /// Resized RGB input, shared with the producing supervisor iteration.
    pub input: Arc<Vec<u8>>,
    pub input_width: u32,
    pub input_height: u32,

    /// Shared collector when the owning stream runs more than one model.
    pub aggregator: Option<Arc<dyn ResultAggregator>>,
}

impl InferTask {
    /// Frame-level fields of this task as a result skeleton.
    pub fn base_result(&self) -> FrameResult {
        FrameResult {
            cam_id: self.cam_id.clone(),
            source_url: self.source_url.clone(),
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
            pts: self.pts,
            original_width: self.original_width,
            original_height: self.original_height,
            results: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_config_defaults_apply() {
        let cfg: ModelConfig = serde_json::from_str(
            r#"{"model_path": "/models/a.bin", "task_name": "phone"}"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, ModelKind::Yolov5);
        assert_eq!(cfg.input_width, 640);
        assert_eq!(cfg.input_height, 640);
        assert!((cfg.conf_threshold - 0.25).abs() < f32::EPSILON);
        assert!((cfg.nms_threshold - 0.45).abs() < f32::EPSILON);
        assert!(cfg.labels_file.is_none());
    }

    #[test]
    fn model_kind_round_trips_lowercase() {
        let json = serde_json::to_string(&ModelKind::Yolov11).unwrap();
        assert_eq!(json, "\"yolov11\"");
        let back: ModelKind = serde_json::from_str("\"yolov8\"").unwrap();
        assert_eq!(back, ModelKind::Yolov8);
    }
}
