use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector backend trait.
///
/// Backends return raw detections: any confidence, class ids as the model
/// emits them. Thresholding, NMS and class naming happen in `Detector`, so a
/// backend only has to be deterministic for identical weights and input.
///
/// Backends run on their own worker thread and must be `Send`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. The frame is borrowed for this call only.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
