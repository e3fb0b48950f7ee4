use anyhow::Result;
use std::time::Duration;

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, Detection};
use crate::frame::Frame;
use crate::worker::InferenceWorker;
use crate::StageStatus;

const UNKNOWN_CLASS: &str = "unknown";

fn run_backend(backend: &mut Box<dyn DetectorBackend>, frame: Frame) -> Result<Vec<Detection>> {
    backend.detect(&frame)
}

/// The detection stage: one backend plus thresholds and class vocabulary.
///
/// A detector whose backend is missing or failed to load is `Degraded`: it
/// logs that once at construction and returns an empty list for every frame.
pub struct Detector {
    worker: Option<InferenceWorker<Frame, Vec<Detection>>>,
    status: StageStatus,
    confidence_threshold: f32,
    iou_threshold: f64,
    classes: Vec<String>,
    timeout: Duration,
}

impl Detector {
    /// Build the detector described by the settings (model file backend).
    pub fn from_settings(settings: &DetectorSettings) -> Self {
        let Some(model_path) = settings.model_path.as_ref() else {
            return Self::unavailable(settings, "no detector model configured");
        };
        #[cfg(feature = "backend-tract")]
        {
            match crate::detect::TractBackend::new(model_path, settings.input_size) {
                Ok(backend) => Self::with_backend(settings, backend),
                Err(e) => Self::unavailable(settings, &format!("{:#}", e)),
            }
        }
        #[cfg(not(feature = "backend-tract"))]
        {
            Self::unavailable(
                settings,
                &format!(
                    "model {} requires the backend-tract feature",
                    model_path.display()
                ),
            )
        }
    }

    /// Wrap an explicit backend. Warm-up failure degrades the stage.
    pub fn with_backend<B: DetectorBackend + 'static>(settings: &DetectorSettings, backend: B) -> Self {
        let mut backend: Box<dyn DetectorBackend> = Box::new(backend);
        let name = backend.name();
        if let Err(e) = backend.warm_up() {
            return Self::unavailable(settings, &format!("{} warm-up failed: {:#}", name, e));
        }
        match InferenceWorker::spawn("detector", backend, run_backend) {
            Ok(worker) => {
                log::info!("detector ready (backend={})", name);
                Self {
                    worker: Some(worker),
                    status: StageStatus::Ready {
                        backend: name.to_string(),
                    },
                    ..Self::base(settings)
                }
            }
            Err(e) => Self::unavailable(settings, &format!("failed to start worker: {}", e)),
        }
    }

    /// A detector with no model. Every call returns an empty list.
    pub fn unavailable(settings: &DetectorSettings, reason: &str) -> Self {
        log::warn!("detector unavailable ({}); no detections will run", reason);
        Self {
            status: StageStatus::Degraded {
                reason: reason.to_string(),
            },
            ..Self::base(settings)
        }
    }

    fn base(settings: &DetectorSettings) -> Self {
        Self {
            worker: None,
            status: StageStatus::Degraded {
                reason: String::new(),
            },
            confidence_threshold: settings.confidence_threshold,
            iou_threshold: settings.iou_threshold as f64,
            classes: settings.classes.clone(),
            timeout: settings.timeout,
        }
    }

    pub fn status(&self) -> &StageStatus {
        &self.status
    }

    /// Detect objects on `frame`. Errors are per-frame (timeout, backend failure).
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(Vec::new());
        };
        let raw = worker.call(frame.clone(), self.timeout)?;
        Ok(self.postprocess(raw))
    }

    fn postprocess(&self, raw: Vec<Detection>) -> Vec<Detection> {
        let named: Vec<Detection> = raw
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .map(|mut d| {
                d.class_name = self
                    .classes
                    .get(d.class_id as usize)
                    .map(String::as_str)
                    .unwrap_or(UNKNOWN_CLASS)
                    .to_string();
                d
            })
            .collect();
        non_max_suppression(named, self.iou_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::detect::ScriptedBackend;
    use crate::frame::BBox;
    use image::RgbImage;

    struct Broken;

    impl DetectorBackend for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Ok(Vec::new())
        }

        fn warm_up(&mut self) -> Result<()> {
            Err(anyhow::anyhow!("weights missing"))
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(index, 10.0, RgbImage::new(16, 16))
    }

    #[test]
    fn applies_threshold_and_vocabulary() {
        let settings = PipelineConfig::default().detector;
        let backend = ScriptedBackend::new().with_frame(
            0,
            vec![
                Detection::new(0, "", BBox::new(0.0, 0.0, 4.0, 8.0), 0.9),
                Detection::new(2, "", BBox::new(8.0, 0.0, 12.0, 8.0), 0.2),
                Detection::new(99, "", BBox::new(8.0, 8.0, 12.0, 12.0), 0.7),
            ],
        );
        let mut detector = Detector::with_backend(&settings, backend);
        assert!(!detector.status().is_degraded());
        let dets = detector.detect(&frame(0)).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_name, "person");
        assert_eq!(dets[1].class_name, "unknown");
    }

    #[test]
    fn missing_model_degrades_to_empty() {
        let settings = PipelineConfig::default().detector;
        let mut detector = Detector::from_settings(&settings);
        assert!(detector.status().is_degraded());
        assert!(detector.detect(&frame(0)).unwrap().is_empty());
    }

    #[test]
    fn warm_up_failure_degrades() {
        let settings = PipelineConfig::default().detector;
        let mut detector = Detector::with_backend(&settings, Broken);
        assert!(detector.status().is_degraded());
        assert!(detector.detect(&frame(5)).unwrap().is_empty());
    }
}
