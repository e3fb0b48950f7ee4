//! Decoded frames and pixel-space geometry.
//!
//! A `Frame` is produced by the ingestion layer and owned by the orchestrator for
//! one loop iteration. Stages borrow it; inference workers receive a cheap clone
//! (the pixel buffer is shared through an `Arc`).

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One decoded video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic frame index, starting at 0.
    pub index: u64,
    /// Seconds since the start of the video (`index / fps`).
    pub timestamp_s: f64,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(index: u64, fps: f64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp_s: timestamp_for(index, fps),
            image: Arc::new(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Read-only view of the RGB pixels.
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Copy of the pixels for stages that draw on the frame.
    pub fn to_owned_image(&self) -> RgbImage {
        self.image.as_ref().clone()
    }
}

/// Timestamp of a frame index at the given frame rate.
pub fn timestamp_for(index: u64, fps: f64) -> f64 {
    if fps > 0.0 {
        index as f64 / fps
    } else {
        0.0
    }
}

/// Axis-aligned bounding box in pixel space (`x1,y1` top-left, `x2,y2` bottom-right).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Ground contact point: middle of the bottom edge.
    pub fn bottom_center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, self.y2)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to an image of the given size.
    pub fn clamped(&self, width: u32, height: u32) -> BBox {
        let w = width as f64;
        let h = height as f64;
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(10.0, 10.0, 20.0, 30.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn half_overlap_iou() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn frame_timestamp_follows_fps() {
        let frame = Frame::new(15, 30.0, RgbImage::new(4, 4));
        assert!((frame.timestamp_s - 0.5).abs() < 1e-12);
        assert_eq!(frame.width(), 4);
        assert_eq!(timestamp_for(10, 0.0), 0.0);
    }

    #[test]
    fn bbox_serializes_as_array() {
        let b = BBox::new(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: BBox = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
