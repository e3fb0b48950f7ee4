use serde::{Deserialize, Serialize};

use crate::frame::BBox;

/// One object found on a frame, in pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    /// Filled from the configured class vocabulary by `Detector`.
    #[serde(default)]
    pub class_name: String,
    pub bbox: BBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: u32, class_name: &str, bbox: BBox, confidence: f32) -> Self {
        Self {
            class_id,
            class_name: class_name.to_string(),
            bbox,
            confidence,
        }
    }
}

/// Greedy non-maximum suppression per class.
///
/// Output order is deterministic: confidence descending, then `x1`, then `y1`.
pub fn non_max_suppression(mut xs: Vec<Detection>, iou_threshold: f64) -> Vec<Detection> {
    xs.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.bbox.x1.total_cmp(&b.bbox.x1))
            .then(a.bbox.y1.total_cmp(&b.bbox.y1))
    });
    let mut kept: Vec<Detection> = Vec::with_capacity(xs.len());
    for det in xs {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == det.class_id && k.bbox.iou(&det.bbox) > iou_threshold);
        if !suppressed {
            kept.push(det);
        }
    }
    kept
}
