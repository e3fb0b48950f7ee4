use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

#[derive(Debug, Deserialize)]
struct ScriptFile {
    frames: Vec<ScriptedFrame>,
}

#[derive(Debug, Deserialize)]
struct ScriptedFrame {
    frame: u64,
    detections: Vec<Detection>,
}

/// Replays recorded detections keyed by frame index.
///
/// Used to re-run the analysis stages over detections captured from an
/// earlier run (or produced offline), and for tests. Frames without an entry
/// yield no detections.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    frames: BTreeMap<u64, Vec<Detection>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a script of the form `{"frames": [{"frame": 0, "detections": [...]}]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        let file: ScriptFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid detection script {}", path.display()))?;
        let mut backend = Self::new();
        for entry in file.frames {
            backend.insert(entry.frame, entry.detections);
        }
        Ok(backend)
    }

    pub fn insert(&mut self, frame: u64, detections: Vec<Detection>) {
        self.frames.entry(frame).or_default().extend(detections);
    }

    pub fn with_frame(mut self, frame: u64, detections: Vec<Detection>) -> Self {
        self.insert(frame, detections);
        self
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BBox;
    use image::RgbImage;
    use std::io::Write;

    #[test]
    fn replays_by_frame_index() {
        let mut backend = ScriptedBackend::new().with_frame(
            2,
            vec![Detection::new(0, "person", BBox::new(0.0, 0.0, 5.0, 5.0), 0.9)],
        );
        let f0 = Frame::new(0, 10.0, RgbImage::new(8, 8));
        let f2 = Frame::new(2, 10.0, RgbImage::new(8, 8));
        assert!(backend.detect(&f0).unwrap().is_empty());
        assert_eq!(backend.detect(&f2).unwrap().len(), 1);
    }

    #[test]
    fn loads_script_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"frames": [{{"frame": 4, "detections": [
                {{"class_id": 0, "bbox": [1, 2, 3, 4], "confidence": 0.8}}
            ]}}]}}"#
        )
        .unwrap();
        let mut backend = ScriptedBackend::load(file.path()).unwrap();
        let f4 = Frame::new(4, 10.0, RgbImage::new(8, 8));
        let dets = backend.detect(&f4).unwrap();
        assert_eq!(dets[0].bbox, BBox::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(dets[0].class_name, "");
    }
}
