use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::compliance::backend::PpeBackend;
use crate::frame::Frame;
use crate::track::Track;

#[derive(Debug, Deserialize)]
struct ScriptFile {
    observations: Vec<ScriptedObservation>,
}

#[derive(Debug, Deserialize)]
struct ScriptedObservation {
    frame: u64,
    track_id: u64,
    attributes: BTreeMap<String, bool>,
}

/// Replays recorded PPE answers keyed by (frame, track id).
#[derive(Clone, Debug, Default)]
pub struct ScriptedPpeBackend {
    answers: BTreeMap<(u64, u64), BTreeMap<String, bool>>,
}

impl ScriptedPpeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `{"observations": [{"frame": 3, "track_id": 1, "attributes": {"hard_hat": false}}]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ppe script {}", path.display()))?;
        let file: ScriptFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid ppe script {}", path.display()))?;
        let mut backend = Self::new();
        for obs in file.observations {
            backend.insert(obs.frame, obs.track_id, obs.attributes);
        }
        Ok(backend)
    }

    pub fn insert(&mut self, frame: u64, track_id: u64, attributes: BTreeMap<String, bool>) {
        self.answers
            .entry((frame, track_id))
            .or_default()
            .extend(attributes);
    }

    /// Same answer for `track_id` on every frame in `frames`.
    pub fn with_range(
        mut self,
        frames: std::ops::Range<u64>,
        track_id: u64,
        attributes: &[(&str, bool)],
    ) -> Self {
        let attrs: BTreeMap<String, bool> = attributes
            .iter()
            .map(|(name, present)| (name.to_string(), *present))
            .collect();
        for frame in frames {
            self.insert(frame, track_id, attrs.clone());
        }
        self
    }
}

impl PpeBackend for ScriptedPpeBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn classify(&mut self, frame: &Frame, track: &Track) -> Result<BTreeMap<String, bool>> {
        Ok(self
            .answers
            .get(&(frame.index, track.object_id()))
            .cloned()
            .unwrap_or_default())
    }
}
