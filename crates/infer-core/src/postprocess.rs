//! Detector output decoding: pure CPU, no driver dependencies.
//!
//! Three detector families are supported, dispatched on [`ModelKind`]:
//! anchor-based three-head outputs (yolov5), anchor-free DFL three-head
//! outputs (yolov8), and the fused single-output layout (yolov11). Shared
//! machinery: class-aware non-maximum suppression, inverse-letterbox
//! coordinate mapping with clamping, and dequantization of int8 tensors.

use tracing::{debug, error};

use crate::{
    runtime::TensorDesc,
    types::{BBox, Detection, ModelKind},
};

/// Head strides for the three-head families, in output order.
pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Standard COCO anchors per stride, `(w, h)` pairs flattened, three anchor
/// cells per grid location.
pub const YOLOV5_ANCHORS: [[f32; 6]; 3] = [
    [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],
    [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],
    [116.0, 90.0, 156.0, 198.0, 373.0, 326.0],
];

const NUM_ANCHORS: usize = 3;
const REG_MAX: usize = 16;

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Intersection over union of two corner-form boxes.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

/// `(q - zero_point) * scale`, elementwise.
pub fn dequantize(data: &[i8], zero_point: i32, scale: f32) -> Vec<f32> {
    data.iter()
        .map(|&q| (q as f32 - zero_point as f32) * scale)
        .collect()
}

/// Decode one DFL distance: expected value of the softmax over `REG_MAX`
/// integer distance bins. The max is subtracted before exponentiation for
/// numerical stability.
pub fn dfl_decode(bins: &[f32]) -> f32 {
    let max = bins.iter().copied().fold(f32::MIN, f32::max);
    let mut sum = 0.0f32;
    let mut expect = 0.0f32;
    for (i, &logit) in bins.iter().enumerate() {
        let e = (logit - max).exp();
        sum += e;
        expect += i as f32 * e;
    }
    expect / sum
}

/// Class-aware non-maximum suppression. Boxes of different classes never
/// suppress one another.
pub fn nms(detections: &mut Vec<Detection>, threshold: f32) {
    if detections.is_empty() {
        return;
    }
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    'candidates: for det in detections.drain(..) {
        for kept in &keep {
            if kept.class_id == det.class_id && iou(&kept.bbox, &det.bbox) > threshold {
                continue 'candidates;
            }
        }
        keep.push(det);
    }
    *detections = keep;
}

/// Map detections from model (letterboxed) space back to original-image
/// coordinates and clamp to the image rectangle.
pub fn scale_coords(
    detections: &mut [Detection],
    model_w: u32,
    model_h: u32,
    orig_w: u32,
    orig_h: u32,
) {
    let (ow, oh) = (orig_w as f32, orig_h as f32);
    let scale = (model_w as f32 / ow).min(model_h as f32 / oh);
    let pad_x = (model_w as f32 - ow * scale) / 2.0;
    let pad_y = (model_h as f32 - oh * scale) / 2.0;

    for det in detections {
        det.bbox.x1 = ((det.bbox.x1 - pad_x) / scale).clamp(0.0, ow);
        det.bbox.y1 = ((det.bbox.y1 - pad_y) / scale).clamp(0.0, oh);
        det.bbox.x2 = ((det.bbox.x2 - pad_x) / scale).clamp(0.0, ow);
        det.bbox.y2 = ((det.bbox.y2 - pad_y) / scale).clamp(0.0, oh);
    }
}

fn class_name(labels: &[String], class_id: usize) -> String {
    labels.get(class_id).cloned().unwrap_or_default()
}

/// Decode outputs for `kind` into detections in original-image coordinates.
///
/// `outputs` are float tensors (already dequantized) matching `descs`
/// order. Malformed shapes decode to an empty list, never a panic.
#[allow(clippy::too_many_arguments)]
pub fn process(
    kind: ModelKind,
    outputs: &[Vec<f32>],
    descs: &[TensorDesc],
    model_w: u32,
    model_h: u32,
    orig_w: u32,
    orig_h: u32,
    conf_threshold: f32,
    nms_threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    let mut detections = match kind {
        ModelKind::Yolov5 => yolov5(outputs, descs, conf_threshold, labels),
        ModelKind::Yolov8 => yolov8(outputs, descs, conf_threshold, labels),
        ModelKind::Yolov11 => yolov11(outputs, descs, conf_threshold, labels),
    };

    debug!(
        "{}: {} candidate(s) before NMS",
        kind.as_str(),
        detections.len()
    );
    nms(&mut detections, nms_threshold);
    scale_coords(&mut detections, model_w, model_h, orig_w, orig_h);
    detections
}

/// Anchor-based decoding: three heads shaped `[1, grid_h, grid_w,
/// 3 * (5 + classes)]`.
fn yolov5(
    outputs: &[Vec<f32>],
    descs: &[TensorDesc],
    conf_threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    if outputs.len() != 3 || descs.len() != 3 {
        error!("yolov5 expects 3 output heads, got {}", outputs.len());
        return Vec::new();
    }

    let mut detections = Vec::new();
    for (head, (data, desc)) in outputs.iter().zip(descs).enumerate() {
        let [_, grid_h, grid_w, channels] = desc.dims[..] else {
            error!("yolov5 head {head}: expected 4D tensor, got {:?}", desc.dims);
            continue;
        };
        if channels % NUM_ANCHORS != 0 || channels / NUM_ANCHORS <= 5 {
            error!("yolov5 head {head}: invalid channel count {channels}");
            continue;
        }
        let entry_size = channels / NUM_ANCHORS;
        if data.len() < grid_h * grid_w * channels {
            error!("yolov5 head {head}: tensor shorter than its shape");
            continue;
        }
        let stride = STRIDES[head] as f32;
        let anchors = &YOLOV5_ANCHORS[head];

        for y in 0..grid_h {
            for x in 0..grid_w {
                for a in 0..NUM_ANCHORS {
                    let offset = (y * grid_w * NUM_ANCHORS + x * NUM_ANCHORS + a) * entry_size;
                    let entry = &data[offset..offset + entry_size];

                    let obj = sigmoid(entry[4]);
                    if obj < conf_threshold {
                        continue;
                    }

                    let (best_class, best_raw) = entry[5..]
                        .iter()
                        .enumerate()
                        .max_by(|a, b| a.1.total_cmp(b.1))
                        .expect("at least one class");
                    let confidence = obj * sigmoid(*best_raw);
                    if confidence < conf_threshold {
                        continue;
                    }

                    let cx = (sigmoid(entry[0]) * 2.0 - 0.5 + x as f32) * stride;
                    let cy = (sigmoid(entry[1]) * 2.0 - 0.5 + y as f32) * stride;
                    let pw = (sigmoid(entry[2]) * 2.0).powi(2) * anchors[a * 2];
                    let ph = (sigmoid(entry[3]) * 2.0).powi(2) * anchors[a * 2 + 1];

                    detections.push(Detection {
                        class_id: best_class as i32,
                        class_name: class_name(labels, best_class),
                        confidence,
                        bbox: BBox {
                            x1: cx - pw / 2.0,
                            y1: cy - ph / 2.0,
                            x2: cx + pw / 2.0,
                            y2: cy + ph / 2.0,
                        },
                    });
                }
            }
        }
    }
    detections
}

/// Anchor-free DFL decoding: three heads shaped `[1, grid_h, grid_w,
/// 4 * 16 + classes]`. The first 64 channels hold four distance
/// distributions; the rest are class logits.
fn yolov8(
    outputs: &[Vec<f32>],
    descs: &[TensorDesc],
    conf_threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    const BOX_CHANNELS: usize = 4 * REG_MAX;

    if outputs.len() != 3 || descs.len() != 3 {
        error!("yolov8 expects 3 output heads, got {}", outputs.len());
        return Vec::new();
    }

    let mut detections = Vec::new();
    for (head, (data, desc)) in outputs.iter().zip(descs).enumerate() {
        let [_, grid_h, grid_w, channels] = desc.dims[..] else {
            error!("yolov8 head {head}: expected 4D tensor, got {:?}", desc.dims);
            continue;
        };
        if channels <= BOX_CHANNELS {
            error!("yolov8 head {head}: channel count {channels} too small");
            continue;
        }
        if data.len() < grid_h * grid_w * channels {
            error!("yolov8 head {head}: tensor shorter than its shape");
            continue;
        }
        let stride = STRIDES[head] as f32;

        for y in 0..grid_h {
            for x in 0..grid_w {
                let offset = (y * grid_w + x) * channels;
                let entry = &data[offset..offset + channels];

                let (best_class, best_raw) = entry[BOX_CHANNELS..]
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .expect("at least one class");
                let confidence = sigmoid(*best_raw);
                if confidence < conf_threshold {
                    continue;
                }

                let left = dfl_decode(&entry[0..REG_MAX]) * stride;
                let top = dfl_decode(&entry[REG_MAX..2 * REG_MAX]) * stride;
                let right = dfl_decode(&entry[2 * REG_MAX..3 * REG_MAX]) * stride;
                let bottom = dfl_decode(&entry[3 * REG_MAX..4 * REG_MAX]) * stride;

                let cx = (x as f32 + 0.5) * stride;
                let cy = (y as f32 + 0.5) * stride;

                detections.push(Detection {
                    class_id: best_class as i32,
                    class_name: class_name(labels, best_class),
                    confidence,
                    bbox: BBox {
                        x1: cx - left,
                        y1: cy - top,
                        x2: cx + right,
                        y2: cy + bottom,
                    },
                });
            }
        }
    }
    detections
}

/// Fused single-output decoding: `[1, 4 + classes, 8400]`, channel-major.
/// Box channels already carry absolute centre/size in model space; class
/// channels are logits.
fn yolov11(
    outputs: &[Vec<f32>],
    descs: &[TensorDesc],
    conf_threshold: f32,
    labels: &[String],
) -> Vec<Detection> {
    let (Some(data), Some(desc)) = (outputs.first(), descs.first()) else {
        error!("yolov11: no output data");
        return Vec::new();
    };
    let [_, channels, num_anchors] = desc.dims[..] else {
        error!("yolov11: expected 3D tensor, got {:?}", desc.dims);
        return Vec::new();
    };
    if channels <= 4 || data.len() < channels * num_anchors {
        error!("yolov11: malformed output ({channels} channels, {} elems)", data.len());
        return Vec::new();
    }
    let num_classes = channels - 4;

    let mut detections = Vec::with_capacity(64);
    for i in 0..num_anchors {
        let mut best_class = 0usize;
        let mut best_raw = f32::MIN;
        for c in 0..num_classes {
            let raw = data[(4 + c) * num_anchors + i];
            if raw > best_raw {
                best_raw = raw;
                best_class = c;
            }
        }
        let confidence = sigmoid(best_raw);
        if confidence < conf_threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[num_anchors + i];
        let w = data[2 * num_anchors + i];
        let h = data[3 * num_anchors + i];

        detections.push(Detection {
            class_id: best_class as i32,
            class_name: class_name(labels, best_class),
            confidence,
            bbox: BBox {
                x1: cx - w * 0.5,
                y1: cy - h * 0.5,
                x2: cx + w * 0.5,
                y2: cy + h * 0.5,
            },
        });
    }
    detections
}
