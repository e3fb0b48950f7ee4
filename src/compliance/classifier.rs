use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::compliance::backend::PpeBackend;
use crate::config::ComplianceSettings;
use crate::event::{Event, EventKind, Presence};
use crate::frame::Frame;
use crate::track::{Compliance, Track};
use crate::worker::InferenceWorker;
use crate::StageStatus;

fn run_backend(
    backend: &mut Box<dyn PpeBackend>,
    (frame, track): (Frame, Track),
) -> Result<BTreeMap<String, bool>> {
    backend.classify(&frame, &track)
}

/// PPE compliance stage.
///
/// Every person track gets one `ppe_observation` per configured attribute on
/// every frame it is seen. Anything the backend cannot answer (missing
/// attribute, error, timeout, no backend at all) is reported as `unknown`.
pub struct ComplianceClassifier {
    worker: Option<InferenceWorker<(Frame, Track), BTreeMap<String, bool>>>,
    status: StageStatus,
    person_class: String,
    attributes: Vec<String>,
    timeout: Duration,
    faults: Vec<String>,
}

impl ComplianceClassifier {
    /// Build the classifier described by the settings (HTTP endpoint backend).
    pub fn from_settings(settings: &ComplianceSettings) -> Self {
        let Some(endpoint) = settings.endpoint.as_deref() else {
            return Self::unavailable(settings, "no classifier endpoint configured");
        };
        #[cfg(feature = "classifier-http")]
        {
            match crate::compliance::HttpPpeBackend::new(endpoint, settings.timeout) {
                Ok(backend) => Self::with_backend(settings, backend),
                Err(e) => Self::unavailable(settings, &format!("{:#}", e)),
            }
        }
        #[cfg(not(feature = "classifier-http"))]
        {
            Self::unavailable(
                settings,
                &format!("endpoint {} requires the classifier-http feature", endpoint),
            )
        }
    }

    pub fn with_backend<B: PpeBackend + 'static>(settings: &ComplianceSettings, backend: B) -> Self {
        let backend: Box<dyn PpeBackend> = Box::new(backend);
        let name = backend.name();
        match InferenceWorker::spawn("ppe", backend, run_backend) {
            Ok(worker) => {
                log::info!("ppe classifier ready (backend={})", name);
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

    pub fn unavailable(settings: &ComplianceSettings, reason: &str) -> Self {
        log::warn!(
            "ppe classifier unavailable ({}); attributes will be reported as unknown",
            reason
        );
        Self {
            status: StageStatus::Degraded {
                reason: reason.to_string(),
            },
            ..Self::base(settings)
        }
    }

    fn base(settings: &ComplianceSettings) -> Self {
        Self {
            worker: None,
            status: StageStatus::Degraded {
                reason: String::new(),
            },
            person_class: settings.person_class.clone(),
            attributes: settings.attributes.clone(),
            timeout: settings.timeout,
            faults: Vec::new(),
        }
    }

    pub fn status(&self) -> &StageStatus {
        &self.status
    }

    /// Classify the person tracks of one frame.
    ///
    /// `spatial_events` are the events already emitted for this frame; tracks
    /// they involve are classified first so a slow backend spends its budget
    /// on the people that matter most.
    pub fn classify(
        &mut self,
        mut tracks: Vec<Track>,
        frame: &Frame,
        frame_index: u64,
        spatial_events: &[Event],
    ) -> (Vec<Track>, Vec<Event>) {
        let flagged: Vec<u64> = spatial_events.iter().flat_map(Event::track_ids).collect();
        let mut order: Vec<usize> = (0..tracks.len())
            .filter(|&i| tracks[i].class_name() == self.person_class)
            .collect();
        order.sort_by_key(|&i| (!flagged.contains(&tracks[i].object_id()), i));

        let mut answers: BTreeMap<u64, Compliance> = BTreeMap::new();
        for i in order {
            let raw = self.query(frame, &tracks[i]);
            let compliance: Compliance = self
                .attributes
                .iter()
                .map(|a| (a.clone(), Presence::from(raw.get(a).copied())))
                .collect();
            answers.insert(tracks[i].object_id(), compliance);
        }

        let mut events = Vec::new();
        for track in &mut tracks {
            let Some(compliance) = answers.remove(&track.object_id()) else {
                continue;
            };
            for attribute in &self.attributes {
                let present = compliance.get(attribute).copied().unwrap_or(Presence::Unknown);
                events.push(Event::new(
                    frame_index,
                    frame.timestamp_s,
                    EventKind::PpeObservation {
                        track_id: track.object_id(),
                        attribute: attribute.clone(),
                        present,
                    },
                ));
            }
            track.compliance = Some(compliance);
        }
        (tracks, events)
    }

    fn query(&mut self, frame: &Frame, track: &Track) -> BTreeMap<String, bool> {
        let Some(worker) = self.worker.as_mut() else {
            return BTreeMap::new();
        };
        match worker.call((frame.clone(), track.clone()), self.timeout) {
            Ok(answer) => answer,
            Err(e) => {
                let message = format!(
                    "frame {} track {}: ppe classifier failed: {}",
                    frame.index,
                    track.object_id(),
                    e
                );
                log::warn!("{}", message);
                self.faults.push(message);
                BTreeMap::new()
            }
        }
    }

    /// Per-call failures since the last call, oldest first.
    pub fn take_faults(&mut self) -> Vec<String> {
        std::mem::take(&mut self.faults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::ScriptedPpeBackend;
    use crate::config::{PipelineConfig, TrackerSettings};
    use crate::detect::Detection;
    use crate::frame::BBox;
    use crate::reference::Anchor;
    use crate::track::{DetectionBatch, Tracker};
    use image::RgbImage;

    struct Failing;

    impl PpeBackend for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn classify(&mut self, _frame: &Frame, _track: &Track) -> Result<BTreeMap<String, bool>> {
            Err(anyhow::anyhow!("vlm offline"))
        }
    }

    fn tracks_for(frame: &Frame) -> Vec<Track> {
        let settings = TrackerSettings {
            match_iou: 0.3,
            patience_frames: 5,
        };
        let mut tracker = Tracker::new(&settings, 10, Anchor::BottomCenter);
        let batch = DetectionBatch::new(
            frame,
            vec![
                Detection::new(0, "person", BBox::new(0.0, 0.0, 10.0, 20.0), 0.9),
                Detection::new(2, "truck", BBox::new(30.0, 0.0, 60.0, 20.0), 0.8),
            ],
        );
        tracker.update(&batch, frame).unwrap()
    }

    fn present(events: &[Event], attribute: &str) -> Option<Presence> {
        events.iter().find_map(|e| match &e.kind {
            EventKind::PpeObservation {
                attribute: a,
                present,
                ..
            } if a == attribute => Some(*present),
            _ => None,
        })
    }

    #[test]
    fn persons_only_with_unknown_fill() {
        let frame = Frame::new(0, 10.0, RgbImage::new(64, 32));
        let settings = PipelineConfig::default().compliance;
        let backend = ScriptedPpeBackend::new().with_range(0..1, 1, &[("hard_hat", false)]);
        let mut classifier = ComplianceClassifier::with_backend(&settings, backend);

        let (tracks, events) = classifier.classify(tracks_for(&frame), &frame, 0, &[]);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.track_ids() == vec![1]));
        assert_eq!(present(&events, "hard_hat"), Some(Presence::No));
        assert_eq!(present(&events, "vest"), Some(Presence::Unknown));
        assert!(tracks[1].compliance.is_none());
        assert_eq!(
            tracks[0].compliance.as_ref().unwrap().get("hard_hat"),
            Some(&Presence::No)
        );
    }

    #[test]
    fn unavailable_reports_unknown() {
        let frame = Frame::new(0, 10.0, RgbImage::new(64, 32));
        let settings = PipelineConfig::default().compliance;
        let mut classifier = ComplianceClassifier::from_settings(&settings);
        assert!(classifier.status().is_degraded());
        let (_, events) = classifier.classify(tracks_for(&frame), &frame, 0, &[]);
        assert_eq!(events.len(), 2);
        assert_eq!(present(&events, "hard_hat"), Some(Presence::Unknown));
        assert!(classifier.take_faults().is_empty());
    }

    #[test]
    fn backend_errors_become_unknown_and_faults() {
        let frame = Frame::new(0, 10.0, RgbImage::new(64, 32));
        let settings = PipelineConfig::default().compliance;
        let mut classifier = ComplianceClassifier::with_backend(&settings, Failing);
        let (_, events) = classifier.classify(tracks_for(&frame), &frame, 0, &[]);
        assert_eq!(present(&events, "vest"), Some(Presence::Unknown));
        let faults = classifier.take_faults();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("vlm offline"));
    }
}
