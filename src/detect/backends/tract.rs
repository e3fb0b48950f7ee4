#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::{BBox, Frame};

const CXYWH_OFFSET: usize = 4;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + nc, N]` with `cx, cy, w, h` in
/// model-input pixels followed by per-class scores. Frames are resized
/// (no letterbox) to a square input of `input_size`.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    min_score: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            min_score: 0.01,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let size = self.input_size;
        let resized = image::imageops::resize(frame.image(), size, size, FilterType::Triangle);
        let size = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let num_classes = shape[1] - CXYWH_OFFSET;
        let anchors = shape[2];
        let sx = frame.width() as f64 / self.input_size as f64;
        let sy = frame.height() as f64 / self.input_size as f64;

        let mut out = Vec::new();
        for a in 0..anchors {
            let (class_id, score) = (0..num_classes)
                .map(|c| (c, preds[[0, CXYWH_OFFSET + c, a]]))
                .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if !(score >= self.min_score) {
                continue;
            }
            let cx = preds[[0, 0, a]] as f64 * sx;
            let cy = preds[[0, 1, a]] as f64 * sy;
            let w = preds[[0, 2, a]] as f64 * sx;
            let h = preds[[0, 3, a]] as f64 * sy;
            let bbox = BBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
                .clamped(frame.width(), frame.height());
            out.push(Detection::new(class_id as u32, "", bbox, score));
        }
        Ok(out)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}
