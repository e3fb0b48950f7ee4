//! Construction-site video processor.
//!
//! This crate turns a fixed-camera site video into structured safety signals:
//! tracked objects with world positions, proximity and time-to-collision
//! alerts, zone entries, and PPE compliance observations.
//!
//! # Architecture
//!
//! One frame-sequential loop feeds each frame through the stages in order:
//!
//! 1. **Detector**: runs on every `frame_skip`-th frame; other frames reuse
//!    the last successful result.
//! 2. **Tracker**: stable ids and bounded trails.
//! 3. **SpatialAnalyzer**: pixel to world projection, velocity, zones,
//!    proximity and TTC.
//! 4. **ComplianceClassifier**: per-person PPE attributes (`yes|no|unknown`).
//! 5. **Sinks**: event log, object log, annotated video, run summary.
//!
//! Model-backed stages run behind traits with scripted backends for replay
//! and tests. A stage without a usable backend is *degraded*, never fatal.
//!
//! # Module Structure
//!
//! - `config`, `reference`: run settings, calibration and zones
//! - `ingest`, `frame`: decoded frames and pixel geometry
//! - `detect`, `track`, `spatial`, `compliance`: the analysis stages
//! - `event`, `log`: the event sum type and its replay digest
//! - `output`: the four sinks
//! - `pipeline`: the orchestrator

use std::fmt;

pub mod compliance;
pub mod config;
pub mod detect;
pub mod event;
pub mod frame;
pub mod ingest;
pub mod log;
pub mod output;
pub mod pipeline;
pub mod reference;
pub mod spatial;
pub mod track;
pub mod worker;

pub use compliance::{ComplianceClassifier, PpeBackend, ScriptedPpeBackend};
pub use config::PipelineConfig;
pub use detect::{Detection, Detector, DetectorBackend, ScriptedBackend};
pub use event::{Event, EventKind, Presence, Severity};
pub use frame::{BBox, Frame};
pub use ingest::{FileSource, VideoInfo};
pub use output::SummaryStats;
pub use pipeline::{
    run_pipeline, CancelToken, FaultClass, FrameSkipPolicy, Pipeline, RunInputs, RunReport,
    RunState, RunStatus, StageFault,
};
pub use reference::{Anchor, Calibration, Zone};
pub use spatial::SpatialAnalyzer;
pub use track::{DetectionBatch, Track, Tracker};

/// Availability of a model-backed stage, fixed for the whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageStatus {
    Ready { backend: String },
    Degraded { reason: String },
}

impl StageStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, StageStatus::Degraded { .. })
    }
}

/// An error that stops a run before any frame is processed.
///
/// Returned wrapped in `anyhow::Error`; callers tell it apart with
/// `err.downcast_ref::<FatalError>()`.
#[derive(Debug)]
pub struct FatalError {
    pub stage: &'static str,
    pub message: String,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal {} error: {}", self.stage, self.message)
    }
}

impl std::error::Error for FatalError {}
