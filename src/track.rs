//! Multi-object tracking by greedy IoU association.
//!
//! The tracker is the only owner of track identity. Downstream stages receive
//! copies of the active tracks for the current frame and may fill in the
//! analysis fields (`world`, `velocity`, `zone`, `compliance`), but ids,
//! classes, boxes and trails can only change through `Tracker::update`.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, VecDeque};

use crate::config::TrackerSettings;
use crate::detect::Detection;
use crate::event::Presence;
use crate::frame::{BBox, Frame};
use crate::reference::Anchor;

/// Detections together with the frame they were computed on.
///
/// When detection is skipped the same batch is handed to the tracker again;
/// `source_frame` is what lets the tracker recognise the repeat.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionBatch {
    pub source_frame: u64,
    pub source_timestamp_s: f64,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn new(frame: &Frame, detections: Vec<Detection>) -> Self {
        Self {
            source_frame: frame.index,
            source_timestamp_s: frame.timestamp_s,
            detections,
        }
    }
}

/// One observed anchor position of a track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrailPoint {
    pub frame: u64,
    pub timestamp_s: f64,
    pub x_px: f64,
    pub y_px: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldPoint {
    pub x_m: f64,
    pub y_m: f64,
}

impl WorldPoint {
    pub fn distance(&self, other: &WorldPoint) -> f64 {
        ((self.x_m - other.x_m).powi(2) + (self.y_m - other.y_m).powi(2)).sqrt()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Velocity {
    pub vx_mps: f64,
    pub vy_mps: f64,
}

/// Per-attribute PPE result for one frame.
pub type Compliance = BTreeMap<String, Presence>;

#[derive(Clone, Debug)]
pub struct Track {
    object_id: u64,
    class_name: String,
    bbox: BBox,
    confidence: f32,
    trail: VecDeque<TrailPoint>,
    first_seen: u64,
    last_seen: u64,
    /// Ground position in metres, once projected.
    pub world: Option<WorldPoint>,
    /// Known once two positions have been observed.
    pub velocity: Option<Velocity>,
    /// First zone (in reference order) containing the track.
    pub zone: Option<String>,
    /// `None` until classified; person tracks only.
    pub compliance: Option<Compliance>,
}

impl Track {
    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Most recent observations, oldest first.
    pub fn trail(&self) -> impl DoubleEndedIterator<Item = &TrailPoint> + ExactSizeIterator {
        self.trail.iter()
    }

    pub fn trail_len(&self) -> usize {
        self.trail.len()
    }

    pub fn first_seen_frame(&self) -> u64 {
        self.first_seen
    }

    /// Source frame of the last detection matched to this track.
    pub fn last_seen_frame(&self) -> u64 {
        self.last_seen
    }
}

pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
    last_applied: Option<u64>,
    match_iou: f64,
    patience_frames: u64,
    trail_len: usize,
    anchor: Anchor,
}

impl Tracker {
    pub fn new(settings: &TrackerSettings, trail_len: usize, anchor: Anchor) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            last_applied: None,
            match_iou: settings.match_iou,
            patience_frames: settings.patience_frames,
            trail_len: trail_len.max(1),
            anchor,
        }
    }

    /// Apply a detection batch and return the active tracks, ordered by id.
    ///
    /// A batch whose source frame was already applied changes nothing.
    pub fn update(&mut self, batch: &DetectionBatch, frame: &Frame) -> Result<Vec<Track>> {
        if self.last_applied.is_some_and(|last| batch.source_frame <= last) {
            return Ok(self.active());
        }
        if let Some(bad) = batch.detections.iter().find(|d| !d.bbox.is_finite()) {
            return Err(anyhow!(
                "frame {}: detection with non-finite box {:?}",
                frame.index,
                bad.bbox
            ));
        }
        let detections: Vec<(usize, BBox, &Detection)> = batch
            .detections
            .iter()
            .enumerate()
            .map(|(i, d)| (i, d.bbox.clamped(frame.width(), frame.height()), d))
            .collect();

        let mut candidates: Vec<(f64, u64, usize)> = Vec::new();
        for (id, track) in &self.tracks {
            for (idx, bbox, det) in &detections {
                if det.class_name != track.class_name {
                    continue;
                }
                let iou = track.bbox.iou(bbox);
                if iou >= self.match_iou && iou > 0.0 {
                    candidates.push((iou, *id, *idx));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut matched_tracks = Vec::new();
        let mut matched_dets = vec![false; detections.len()];
        for (_, id, idx) in candidates {
            if matched_dets[idx] || matched_tracks.contains(&id) {
                continue;
            }
            matched_dets[idx] = true;
            matched_tracks.push(id);
            let (_, bbox, det) = detections[idx];
            let point = self.trail_point(&bbox, batch);
            if let Some(track) = self.tracks.get_mut(&id) {
                track.bbox = bbox;
                track.confidence = det.confidence;
                track.last_seen = batch.source_frame;
                push_bounded(&mut track.trail, point, self.trail_len);
            }
        }

        let patience = self.patience_frames;
        let source = batch.source_frame;
        self.tracks.retain(|id, track| {
            let keep = matched_tracks.contains(id) || source - track.last_seen <= patience;
            if !keep {
                log::debug!(
                    "track {} ({}) left the scene at frame {}",
                    id,
                    track.class_name,
                    source
                );
            }
            keep
        });

        for (idx, bbox, det) in &detections {
            if matched_dets[*idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut trail = VecDeque::with_capacity(self.trail_len);
            trail.push_back(self.trail_point(bbox, batch));
            self.tracks.insert(
                id,
                Track {
                    object_id: id,
                    class_name: det.class_name.clone(),
                    bbox: *bbox,
                    confidence: det.confidence,
                    trail,
                    first_seen: source,
                    last_seen: source,
                    world: None,
                    velocity: None,
                    zone: None,
                    compliance: None,
                },
            );
        }

        self.last_applied = Some(source);
        Ok(self.active())
    }

    /// Copies of the active tracks, ordered by id.
    pub fn active(&self) -> Vec<Track> {
        self.tracks.values().cloned().collect()
    }

    fn trail_point(&self, bbox: &BBox, batch: &DetectionBatch) -> TrailPoint {
        let (x_px, y_px) = match self.anchor {
            Anchor::BottomCenter => bbox.bottom_center(),
            Anchor::Center => bbox.center(),
        };
        TrailPoint {
            frame: batch.source_frame,
            timestamp_s: batch.source_timestamp_s,
            x_px,
            y_px,
        }
    }
}

fn push_bounded(trail: &mut VecDeque<TrailPoint>, point: TrailPoint, max_len: usize) {
    trail.push_back(point);
    while trail.len() > max_len {
        trail.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn settings(patience: u64) -> TrackerSettings {
        TrackerSettings {
            match_iou: 0.3,
            patience_frames: patience,
        }
    }

    fn frame(index: u64) -> Frame {
        Frame::new(index, 10.0, RgbImage::new(200, 200))
    }

    fn person(x: f64) -> Detection {
        Detection::new(0, "person", BBox::new(x, 10.0, x + 20.0, 60.0), 0.9)
    }

    fn apply(tracker: &mut Tracker, index: u64, dets: Vec<Detection>) -> Vec<Track> {
        let f = frame(index);
        let batch = DetectionBatch::new(&f, dets);
        tracker.update(&batch, &f).unwrap()
    }

    #[test]
    fn ids_are_monotonic_and_stable() {
        let mut tracker = Tracker::new(&settings(30), 10, Anchor::BottomCenter);
        let t0 = apply(&mut tracker, 0, vec![person(10.0), person(100.0)]);
        assert_eq!(t0.iter().map(Track::object_id).collect::<Vec<_>>(), vec![1, 2]);
        let t1 = apply(&mut tracker, 1, vec![person(102.0), person(12.0)]);
        assert_eq!(t1[0].bbox().x1, 12.0);
        assert_eq!(t1[1].bbox().x1, 102.0);
        let t2 = apply(&mut tracker, 2, vec![person(14.0), person(104.0), person(170.0)]);
        assert_eq!(t2.iter().map(Track::object_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn repeated_batch_is_a_no_op() {
        let mut tracker = Tracker::new(&settings(30), 10, Anchor::BottomCenter);
        let f0 = frame(0);
        let batch = DetectionBatch::new(&f0, vec![person(10.0)]);
        let first = tracker.update(&batch, &f0).unwrap();
        for index in 1..5 {
            let again = tracker.update(&batch, &frame(index)).unwrap();
            assert_eq!(again.len(), 1);
            assert_eq!(again[0].object_id(), first[0].object_id());
            assert_eq!(again[0].trail_len(), 1);
        }
    }

    #[test]
    fn trail_is_bounded_suffix() {
        let mut tracker = Tracker::new(&settings(30), 4, Anchor::BottomCenter);
        let mut history = Vec::new();
        let mut last = Vec::new();
        for i in 0..10u64 {
            last = apply(&mut tracker, i, vec![person(10.0 + i as f64)]);
            history.push(last[0].trail().last().copied().unwrap());
            assert!(last[0].trail_len() <= 4);
        }
        let trail: Vec<TrailPoint> = last[0].trail().copied().collect();
        assert_eq!(trail.as_slice(), &history[history.len() - 4..]);
    }

    #[test]
    fn unmatched_tracks_age_out_after_patience() {
        let mut tracker = Tracker::new(&settings(3), 10, Anchor::BottomCenter);
        apply(&mut tracker, 0, vec![person(10.0)]);
        assert_eq!(apply(&mut tracker, 3, vec![]).len(), 1);
        assert!(apply(&mut tracker, 4, vec![]).is_empty());
        let back = apply(&mut tracker, 5, vec![person(10.0)]);
        assert_eq!(back[0].object_id(), 2);
    }

    #[test]
    fn class_mismatch_never_matches() {
        let mut tracker = Tracker::new(&settings(30), 10, Anchor::BottomCenter);
        apply(&mut tracker, 0, vec![person(10.0)]);
        let truck = Detection::new(2, "truck", BBox::new(10.0, 10.0, 30.0, 60.0), 0.8);
        let tracks = apply(&mut tracker, 1, vec![truck]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].class_name(), "truck");
    }

    #[test]
    fn ties_prefer_lowest_track_id() {
        let mut tracker = Tracker::new(&settings(30), 10, Anchor::BottomCenter);
        // Two identical tracks, one detection: track 1 wins.
        apply(&mut tracker, 0, vec![person(10.0), person(10.0)]);
        let tracks = apply(&mut tracker, 1, vec![person(10.0)]);
        assert_eq!(tracks[0].last_seen_frame(), 1);
        assert_eq!(tracks[1].last_seen_frame(), 0);
    }

    #[test]
    fn non_finite_boxes_are_rejected() {
        let mut tracker = Tracker::new(&settings(30), 10, Anchor::BottomCenter);
        let f = frame(0);
        let bad = Detection::new(0, "person", BBox::new(f64::NAN, 0.0, 1.0, 1.0), 0.9);
        let batch = DetectionBatch::new(&f, vec![bad]);
        assert!(tracker.update(&batch, &f).is_err());
        assert!(tracker.active().is_empty());
    }
}
