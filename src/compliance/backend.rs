use anyhow::Result;
use std::collections::BTreeMap;

use crate::frame::Frame;
use crate::track::Track;

/// PPE attribute classifier backend.
///
/// Answers which attributes are visibly present on one tracked person.
/// Attributes left out of the answer are treated as not checked.
pub trait PpeBackend: Send {
    fn name(&self) -> &'static str;

    fn classify(&mut self, frame: &Frame, track: &Track) -> Result<BTreeMap<String, bool>>;
}
