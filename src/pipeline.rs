//! Orchestrator: loads reference data, drives the frame loop, flushes sinks.
//!
//! `Idle -> Loading -> Running -> Flushing -> Done`, with `Failed` reachable
//! from `Loading` only. Once frames flow, stage failures are per-frame faults:
//! logged, recorded in the report, and the loop moves on.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::compliance::{ComplianceClassifier, PpeBackend};
use crate::config::PipelineConfig;
use crate::detect::{Detector, DetectorBackend};
use crate::frame::Frame;
use crate::ingest::{FileSource, VideoInfo};
use crate::output::{FrameOutput, SinkSet, SummaryStats, EVENT_LOG_SINK};
use crate::reference::{load_zones, Calibration, Zone};
use crate::spatial::SpatialAnalyzer;
use crate::track::{DetectionBatch, Track, Tracker};
use crate::{FatalError, StageStatus};

/// Consecutive undecodable frames after which the stream is treated as ended.
pub const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 25;
const PROGRESS_EVERY: u64 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Running,
    Flushing,
    Done,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// Aborts the run before the frame loop.
    Fatal,
    /// A stage runs without its backend for the whole run.
    Degraded,
    /// One frame's contribution from one component was lost.
    Transient,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageFault {
    pub stage: &'static str,
    pub class: FaultClass,
    pub frame: Option<u64>,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Degraded,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Degraded => "degraded",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Cooperative cancellation, checked between frames.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Detection runs on every `frame_skip`-th frame, starting at frame 0.
#[derive(Clone, Copy, Debug)]
pub struct FrameSkipPolicy {
    every: u64,
}

impl FrameSkipPolicy {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }

    pub fn should_detect(&self, frame_index: u64) -> bool {
        frame_index % self.every == 0
    }
}

#[derive(Clone, Debug)]
pub struct RunInputs {
    /// Video file path, or a `stub://` synthetic source.
    pub video: String,
    pub calibration: PathBuf,
    pub zones: PathBuf,
    pub out_dir: PathBuf,
}

#[derive(Debug)]
pub struct RunReport {
    pub state: RunState,
    pub frames_processed: u64,
    pub duration: Duration,
    pub stats: SummaryStats,
    pub faults: Vec<StageFault>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.cancelled {
            RunStatus::Cancelled
        } else if self.faults.is_empty() && self.stats.sink_faults.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::Degraded
        }
    }

    pub fn faults_of(&self, class: FaultClass) -> impl Iterator<Item = &StageFault> {
        self.faults.iter().filter(move |f| f.class == class)
    }
}

struct Loaded {
    calibration: Calibration,
    zones: Vec<Zone>,
    source: FileSource,
    out_dir: PathBuf,
}

/// Mutable per-run state of the frame loop.
struct FrameLoop {
    policy: FrameSkipPolicy,
    detector: Detector,
    tracker: Tracker,
    spatial: SpatialAnalyzer,
    classifier: ComplianceClassifier,
    sinks: SinkSet,
    stats: SummaryStats,
    faults: Vec<StageFault>,
    last_detections: Option<DetectionBatch>,
    last_tracks: Vec<Track>,
}

pub struct Pipeline {
    config: PipelineConfig,
    detector: Option<Detector>,
    classifier: Option<ComplianceClassifier>,
    cancel: CancelToken,
    progress: Option<Box<dyn FnMut(u64, Option<u64>)>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: None,
            classifier: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Use `backend` instead of the model named in the configuration.
    pub fn with_detector_backend<B: DetectorBackend + 'static>(mut self, backend: B) -> Self {
        self.detector = Some(Detector::with_backend(&self.config.detector, backend));
        self
    }

    /// Use `backend` instead of the endpoint named in the configuration.
    pub fn with_ppe_backend<B: PpeBackend + 'static>(mut self, backend: B) -> Self {
        self.classifier = Some(ComplianceClassifier::with_backend(
            &self.config.compliance,
            backend,
        ));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called after every processed frame with (frames processed, expected total).
    pub fn with_progress(mut self, progress: impl FnMut(u64, Option<u64>) + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(mut self, inputs: &RunInputs) -> Result<RunReport> {
        let started = Instant::now();
        let mut state = RunState::Idle;
        transition(&mut state, RunState::Loading);
        let loaded = match self.load(inputs) {
            Ok(loaded) => loaded,
            Err(e) => {
                transition(&mut state, RunState::Failed);
                log::error!("run failed while loading: {:#}", e);
                return Err(e);
            }
        };
        let Loaded {
            calibration,
            zones,
            mut source,
            out_dir,
        } = loaded;
        let info = source.info().clone();

        let detector = self
            .detector
            .take()
            .unwrap_or_else(|| Detector::from_settings(&self.config.detector));
        let classifier = self
            .classifier
            .take()
            .unwrap_or_else(|| ComplianceClassifier::from_settings(&self.config.compliance));
        let mut stats = SummaryStats::default();
        let mut faults = Vec::new();
        for (stage, status) in [("detector", detector.status()), ("ppe_classifier", classifier.status())] {
            if let StageStatus::Degraded { reason } = status {
                stats.degraded.push(format!("{}: {}", stage, reason));
                faults.push(StageFault {
                    stage,
                    class: FaultClass::Degraded,
                    frame: None,
                    message: reason.clone(),
                });
            }
        }

        let mut run = FrameLoop {
            policy: FrameSkipPolicy::new(self.config.frame_skip),
            detector,
            tracker: Tracker::new(&self.config.tracker, self.config.trail_len, calibration.anchor()),
            spatial: SpatialAnalyzer::new(
                Arc::new(calibration),
                Arc::new(zones),
                self.config.spatial.clone(),
            ),
            classifier,
            sinks: SinkSet::create(
                &out_dir,
                info.fps,
                &self.config.compliance.attributes,
                self.config.write_video,
            ),
            stats,
            faults,
            last_detections: None,
            last_tracks: Vec::new(),
        };

        transition(&mut state, RunState::Running);
        let mut frames_processed = 0u64;
        let mut consecutive_errors = 0u32;
        let mut cancelled = false;
        loop {
            if self.cancel.is_cancelled() {
                log::warn!("cancelled after {} frames", frames_processed);
                cancelled = true;
                break;
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    frame
                }
                Ok(None) => break,
                Err(e) => {
                    consecutive_errors += 1;
                    let index = source.frames_read().saturating_sub(1);
                    run.transient("ingest", index, format!("{:#}", e));
                    if consecutive_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
                        log::error!(
                            "{} consecutive frames failed to decode; ending stream",
                            consecutive_errors
                        );
                        break;
                    }
                    continue;
                }
            };
            run.process(&frame);
            frames_processed += 1;
            if frames_processed % PROGRESS_EVERY == 0 {
                log::info!(
                    "processed {} frames ({} events so far)",
                    frames_processed,
                    run.stats.events_total
                );
            }
            if let Some(progress) = self.progress.as_mut() {
                progress(frames_processed, info.frame_count);
            }
        }

        transition(&mut state, RunState::Flushing);
        let FrameLoop {
            mut sinks,
            mut stats,
            faults,
            ..
        } = run;
        for fault in faults.iter().filter(|f| f.class == FaultClass::Transient) {
            *stats.transient_faults.entry(fault.stage.to_string()).or_default() += 1;
        }
        stats.frames_processed = frames_processed;
        stats.video_duration_s = video_duration(source.frames_read(), &info);
        stats.wall_clock_s = started.elapsed().as_secs_f64();
        let mut report = RunReport {
            state,
            frames_processed,
            duration: started.elapsed(),
            stats: SummaryStats::default(),
            faults,
            cancelled,
        };
        stats.status = report.status().as_str().to_string();
        sinks.finish(&mut stats);
        report.stats = stats;
        // Sink failures while finishing can still degrade the run.
        report.stats.status = report.status().as_str().to_string();
        transition(&mut state, RunState::Done);
        report.state = state;
        report.duration = started.elapsed();
        log::info!(
            "run {}: {} frames, {} events in {:.2}s",
            report.stats.status,
            report.frames_processed,
            report.stats.events_total,
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    fn load(&self, inputs: &RunInputs) -> Result<Loaded> {
        self.config.validate().map_err(|e| fatal("config", e))?;
        let calibration = Calibration::load(&inputs.calibration).map_err(|e| fatal("calibration", e))?;
        let zones = load_zones(&inputs.zones).map_err(|e| fatal("zones", e))?;
        log::info!(
            "loaded calibration {} and {} zones",
            inputs.calibration.display(),
            zones.len()
        );
        let source = FileSource::open(&inputs.video, self.config.fallback_fps)
            .map_err(|e| fatal("video", e))?;
        std::fs::create_dir_all(&inputs.out_dir)
            .with_context(|| format!("create output directory {}", inputs.out_dir.display()))
            .map_err(|e| fatal("output", e))?;
        Ok(Loaded {
            calibration,
            zones,
            source,
            out_dir: inputs.out_dir.clone(),
        })
    }
}

impl FrameLoop {
    fn process(&mut self, frame: &Frame) {
        if self.policy.should_detect(frame.index) {
            match self.detector.detect(frame) {
                Ok(detections) => {
                    self.last_detections = Some(DetectionBatch::new(frame, detections));
                }
                Err(e) => self.transient("detector", frame.index, format!("{:#}", e)),
            }
        }

        let fresh = self
            .last_detections
            .as_ref()
            .filter(|batch| batch.source_frame == frame.index);
        let tracks = match fresh {
            Some(batch) => match self.tracker.update(batch, frame) {
                Ok(tracks) => {
                    self.last_tracks = tracks.clone();
                    tracks
                }
                Err(e) => {
                    self.transient("tracker", frame.index, format!("{:#}", e));
                    self.last_tracks.clone()
                }
            },
            None => self.last_tracks.clone(),
        };

        let (tracks, mut events) = self.spatial.analyze(tracks, frame.index, frame.timestamp_s);
        let (tracks, ppe_events) = self.classifier.classify(tracks, frame, frame.index, &events);
        for message in self.classifier.take_faults() {
            self.faults.push(StageFault {
                stage: "ppe_classifier",
                class: FaultClass::Transient,
                frame: Some(frame.index),
                message,
            });
        }
        events.extend(ppe_events);

        publish(
            &mut self.sinks,
            &mut self.stats,
            &FrameOutput {
                frame,
                tracks: &tracks,
                events: &events,
            },
        );
    }

    fn transient(&mut self, stage: &'static str, frame: u64, message: String) {
        log::warn!("frame {}: {} fault: {}", frame, stage, message);
        self.faults.push(StageFault {
            stage,
            class: FaultClass::Transient,
            frame: Some(frame),
            message,
        });
    }
}

/// Tally the frame's events and hand the frame to every sink. Events the
/// event log failed to store are counted as unwritten.
fn publish(sinks: &mut SinkSet, stats: &mut SummaryStats, out: &FrameOutput<'_>) {
    for event in out.events {
        stats.record(event);
    }
    let failed = sinks.write_frame(out);
    if failed.contains(&EVENT_LOG_SINK) {
        stats.events_unwritten += out.events.len() as u64;
    }
}

fn transition(state: &mut RunState, next: RunState) {
    log::debug!("pipeline state {:?} -> {:?}", state, next);
    *state = next;
}

fn fatal(stage: &'static str, err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(FatalError {
        stage,
        message: format!("{:#}", err),
    })
}

fn video_duration(frames_read: u64, info: &VideoInfo) -> f64 {
    frames_read as f64 / info.fps
}

/// Process one video with the configuration from `SITE_CONFIG` (or defaults).
pub fn run_pipeline(
    video: &Path,
    calibration: &Path,
    zones: &Path,
    out_dir: &Path,
) -> Result<RunReport> {
    let config = PipelineConfig::load(None).map_err(|e| fatal("config", e))?;
    let inputs = RunInputs {
        video: video.to_string_lossy().into_owned(),
        calibration: calibration.to_path_buf(),
        zones: zones.to_path_buf(),
        out_dir: out_dir.to_path_buf(),
    };
    Pipeline::new(config).run(&inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind};
    use crate::output::Sink;
    use image::RgbImage;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn skip_policy() {
        let every_fifth = FrameSkipPolicy::new(5);
        let detected: Vec<u64> = (0..12).filter(|i| every_fifth.should_detect(*i)).collect();
        assert_eq!(detected, vec![0, 5, 10]);
        let every = FrameSkipPolicy::new(0);
        assert!((0..4).all(|i| every.should_detect(i)));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    struct FailsOn {
        name: &'static str,
        frame: u64,
        seen: Rc<RefCell<u64>>,
    }

    impl Sink for FailsOn {
        fn name(&self) -> &'static str {
            self.name
        }

        fn write_frame(&mut self, out: &FrameOutput<'_>) -> Result<()> {
            if out.frame.index == self.frame {
                anyhow::bail!("no space left on device");
            }
            *self.seen.borrow_mut() += out.events.len() as u64;
            Ok(())
        }

        fn finish(&mut self, _stats: &SummaryStats) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lost_event_log_writes_are_reported() {
        let logged = Rc::new(RefCell::new(0));
        let other = Rc::new(RefCell::new(0));
        let mut sinks = SinkSet::new();
        sinks.push(Box::new(FailsOn {
            name: EVENT_LOG_SINK,
            frame: 1,
            seen: logged.clone(),
        }));
        sinks.push(Box::new(FailsOn {
            name: "object_log",
            frame: 2,
            seen: other.clone(),
        }));
        let mut stats = SummaryStats::default();
        for i in 0..3u64 {
            let frame = Frame::new(i, 10.0, RgbImage::new(4, 4));
            let events: Vec<Event> = (0..2)
                .map(|t| {
                    Event::new(
                        i,
                        frame.timestamp_s,
                        EventKind::ZoneEntry {
                            track_id: t + 1,
                            zone: "gate".into(),
                        },
                    )
                })
                .collect();
            publish(
                &mut sinks,
                &mut stats,
                &FrameOutput {
                    frame: &frame,
                    tracks: &[],
                    events: &events,
                },
            );
        }
        stats.status = "complete".into();
        sinks.finish(&mut stats);

        assert_eq!(stats.events_total, 6);
        assert_eq!(stats.events_unwritten, 2);
        assert_eq!(stats.events_total - stats.events_unwritten, *logged.borrow());
        assert_eq!(*other.borrow(), 4);
        assert_eq!(stats.status, "degraded");
        let text = stats.render_text();
        let last = text.lines().last().unwrap();
        assert!(last.contains("event log: 2 events unwritten"));
        assert!(last.contains("sink event_log: 1 faults"));
    }

    #[test]
    fn status_priority() {
        let mut report = RunReport {
            state: RunState::Done,
            frames_processed: 1,
            duration: Duration::ZERO,
            stats: SummaryStats::default(),
            faults: Vec::new(),
            cancelled: false,
        };
        assert_eq!(report.status(), RunStatus::Complete);
        report.faults.push(StageFault {
            stage: "ingest",
            class: FaultClass::Transient,
            frame: Some(0),
            message: "corrupt".into(),
        });
        assert_eq!(report.status(), RunStatus::Degraded);
        assert_eq!(report.faults_of(FaultClass::Transient).count(), 1);
        report.cancelled = true;
        assert_eq!(report.status(), RunStatus::Cancelled);
    }
}
