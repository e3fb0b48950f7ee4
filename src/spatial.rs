//! World-space analysis: projection, velocity, zone entry, proximity and TTC.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::SpatialSettings;
use crate::event::{Event, EventKind, Severity};
use crate::reference::{Calibration, Zone};
use crate::track::{Track, Velocity, WorldPoint};

pub struct SpatialAnalyzer {
    calibration: Arc<Calibration>,
    zones: Arc<Vec<Zone>>,
    settings: SpatialSettings,
    /// (track id, zone index) pairs currently inside.
    inside: BTreeSet<(u64, usize)>,
}

impl SpatialAnalyzer {
    pub fn new(calibration: Arc<Calibration>, zones: Arc<Vec<Zone>>, settings: SpatialSettings) -> Self {
        Self {
            calibration,
            zones,
            settings,
            inside: BTreeSet::new(),
        }
    }

    /// Enrich `tracks` with world position, velocity and zone, and emit the
    /// frame's spatial events in a stable order.
    pub fn analyze(
        &mut self,
        mut tracks: Vec<Track>,
        frame_index: u64,
        timestamp_s: f64,
    ) -> (Vec<Track>, Vec<Event>) {
        tracks.sort_by_key(Track::object_id);
        let mut events = Vec::new();

        for track in &mut tracks {
            let (u, v) = self.calibration.anchor_point(track.bbox());
            track.world = self
                .calibration
                .to_world(u, v)
                .map(|(x_m, y_m)| WorldPoint { x_m, y_m });
            track.velocity = self.velocity(track);
        }

        let mut still_inside = BTreeSet::new();
        for track in &mut tracks {
            let id = track.object_id();
            track.zone = None;
            let Some(pos) = track.world else {
                // Unknown position: keep the previous membership state.
                still_inside.extend(self.inside.range((id, 0)..=(id, usize::MAX)).copied());
                continue;
            };
            for (zi, zone) in self.zones.iter().enumerate() {
                if !zone.contains(pos.x_m, pos.y_m) {
                    continue;
                }
                if track.zone.is_none() {
                    track.zone = Some(zone.name.clone());
                }
                still_inside.insert((id, zi));
                if !self.inside.contains(&(id, zi)) {
                    events.push(Event::new(
                        frame_index,
                        timestamp_s,
                        EventKind::ZoneEntry {
                            track_id: id,
                            zone: zone.name.clone(),
                        },
                    ));
                }
            }
        }
        // Tracks absent from this frame drop out here as well.
        self.inside = still_inside;

        for (i, a) in tracks.iter().enumerate() {
            for b in &tracks[i + 1..] {
                self.pair_events(a, b, frame_index, timestamp_s, &mut events);
            }
        }

        (tracks, events)
    }

    fn velocity(&self, track: &Track) -> Option<Velocity> {
        let mut recent = track.trail().rev();
        let last = recent.next()?;
        let prev = recent.next()?;
        let dt = last.timestamp_s - prev.timestamp_s;
        if dt <= 0.0 {
            return None;
        }
        let (x1, y1) = self.calibration.to_world(last.x_px, last.y_px)?;
        let (x0, y0) = self.calibration.to_world(prev.x_px, prev.y_px)?;
        Some(Velocity {
            vx_mps: (x1 - x0) / dt,
            vy_mps: (y1 - y0) / dt,
        })
    }

    fn pair_events(
        &self,
        a: &Track,
        b: &Track,
        frame_index: u64,
        timestamp_s: f64,
        events: &mut Vec<Event>,
    ) {
        let (Some(pa), Some(pb)) = (a.world, b.world) else {
            return;
        };
        let track_ids = [a.object_id(), b.object_id()];
        let distance_m = pa.distance(&pb);
        let s = &self.settings;

        let severity = if distance_m < s.critical_distance_m {
            Some(Severity::Critical)
        } else if distance_m < s.warning_distance_m {
            Some(Severity::Warning)
        } else {
            None
        };
        if let Some(severity) = severity {
            events.push(Event::new(
                frame_index,
                timestamp_s,
                EventKind::ProximityAlert {
                    track_ids,
                    severity,
                    distance_m,
                },
            ));
        }

        if distance_m < s.critical_distance_m {
            return;
        }
        let zero = Velocity {
            vx_mps: 0.0,
            vy_mps: 0.0,
        };
        let va = a.velocity.unwrap_or(zero);
        let vb = b.velocity.unwrap_or(zero);
        let rel_pos = (pb.x_m - pa.x_m, pb.y_m - pa.y_m);
        let rel_vel = (vb.vx_mps - va.vx_mps, vb.vy_mps - va.vy_mps);
        if let Some(ttc_s) = time_to_collision(rel_pos, rel_vel, s.collision_radius_m) {
            if ttc_s <= s.ttc_horizon_s {
                events.push(Event::new(
                    frame_index,
                    timestamp_s,
                    EventKind::TtcWarning {
                        track_ids,
                        ttc_s,
                        distance_m,
                    },
                ));
            }
        }
    }
}

/// First time `t > 0` at which `|r + v t|` shrinks to `radius`.
///
/// `None` when the objects are not closing or pass each other wider than `radius`.
pub fn time_to_collision(r: (f64, f64), v: (f64, f64), radius: f64) -> Option<f64> {
    let a = v.0 * v.0 + v.1 * v.1;
    let b = 2.0 * (r.0 * v.0 + r.1 * v.1);
    let c = r.0 * r.0 + r.1 * r.1 - radius * radius;
    if a <= f64::EPSILON || b >= 0.0 {
        return None;
    }
    if c <= 0.0 {
        return Some(0.0);
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (-b - disc.sqrt()) / (2.0 * a);
    (t > 0.0).then_some(t)
}
