//! Events emitted by the analysis stages.
//!
//! Events are immutable once emitted. Every sink and the summary match on
//! `EventKind` exhaustively, so adding a kind is a compile error until each
//! consumer handles it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// Result of checking one PPE attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Yes,
    No,
    Unknown,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Yes => "yes",
            Presence::No => "no",
            Presence::Unknown => "unknown",
        }
    }
}

impl From<Option<bool>> for Presence {
    fn from(v: Option<bool>) -> Self {
        match v {
            Some(true) => Presence::Yes,
            Some(false) => Presence::No,
            None => Presence::Unknown,
        }
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ProximityAlert {
        track_ids: [u64; 2],
        severity: Severity,
        distance_m: f64,
    },
    TtcWarning {
        track_ids: [u64; 2],
        ttc_s: f64,
        distance_m: f64,
    },
    ZoneEntry {
        track_id: u64,
        zone: String,
    },
    PpeObservation {
        track_id: u64,
        attribute: String,
        present: Presence,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub frame: u64,
    pub timestamp_s: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(frame: u64, timestamp_s: f64, kind: EventKind) -> Self {
        Self {
            frame,
            timestamp_s,
            kind,
        }
    }

    /// Track ids involved, in ascending order.
    pub fn track_ids(&self) -> Vec<u64> {
        match &self.kind {
            EventKind::ProximityAlert { track_ids, .. } | EventKind::TtcWarning { track_ids, .. } => {
                track_ids.to_vec()
            }
            EventKind::ZoneEntry { track_id, .. } | EventKind::PpeObservation { track_id, .. } => {
                vec![*track_id]
            }
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self.kind {
            EventKind::ProximityAlert { .. } => "proximity_alert",
            EventKind::TtcWarning { .. } => "ttc_warning",
            EventKind::ZoneEntry { .. } => "zone_entry",
            EventKind::PpeObservation { .. } => "ppe_observation",
        }
    }
}
