//! Output sinks.
//!
//! Four independent writers share one per-frame view of the pipeline state.
//! `SinkSet` is the error boundary: a sink that fails on one frame is logged
//! and counted, and the remaining sinks still see that frame.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use crate::event::Event;
use crate::frame::Frame;
use crate::track::Track;

mod events;
mod object_log;
mod summary;
mod video;

pub use events::EventLogWriter;
pub use object_log::ObjectLogWriter;
pub use summary::{PpeTally, SummaryStats, SummaryWriter};
pub use video::{AnnotatedVideoWriter, Y4mEncoder};

pub const EVENTS_FILE: &str = "events.jsonl";
pub const OBJECT_LOG_FILE: &str = "object_log.csv";
pub const SUMMARY_TEXT_FILE: &str = "summary.txt";
pub const SUMMARY_JSON_FILE: &str = "summary.json";

/// Sink name of the event log, as it appears in fault counts.
pub const EVENT_LOG_SINK: &str = "event_log";

/// Everything a sink may look at for one processed frame.
pub struct FrameOutput<'a> {
    pub frame: &'a Frame,
    pub tracks: &'a [Track],
    pub events: &'a [Event],
}

pub trait Sink {
    fn name(&self) -> &'static str;

    fn write_frame(&mut self, out: &FrameOutput<'_>) -> Result<()>;

    /// Called once after the last frame. `stats` is final apart from faults
    /// raised by sinks finishing after this one.
    fn finish(&mut self, stats: &SummaryStats) -> Result<()>;
}

struct Slot {
    sink: Box<dyn Sink>,
    faults: u64,
}

#[derive(Default)]
pub struct SinkSet {
    slots: Vec<Slot>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard four sinks in `dir`. Sinks that cannot be created are
    /// logged and left out; the others still run.
    pub fn create(dir: &Path, fps: f64, attributes: &[String], with_video: bool) -> Self {
        let mut set = Self::new();
        set.open("event log", || Ok(Box::new(EventLogWriter::create(dir)?) as Box<dyn Sink>));
        set.open("object log", || {
            Ok(Box::new(ObjectLogWriter::create(dir, attributes)?) as Box<dyn Sink>)
        });
        if with_video {
            set.open("annotated video", || {
                Ok(Box::new(AnnotatedVideoWriter::create(dir, fps)?) as Box<dyn Sink>)
            });
        }
        set.push(Box::new(SummaryWriter::new(dir)));
        set
    }

    fn open(&mut self, what: &str, make: impl FnOnce() -> Result<Box<dyn Sink>>) {
        match make() {
            Ok(sink) => self.push(sink),
            Err(e) => log::error!("{} disabled: {:#}", what, e),
        }
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.slots.push(Slot { sink, faults: 0 });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hand one frame to every sink. Returns the names of the sinks that failed.
    pub fn write_frame(&mut self, out: &FrameOutput<'_>) -> Vec<&'static str> {
        let mut failed = Vec::new();
        for slot in &mut self.slots {
            if let Err(e) = slot.sink.write_frame(out) {
                slot.faults += 1;
                failed.push(slot.sink.name());
                log::warn!(
                    "sink {} failed on frame {}: {:#}",
                    slot.sink.name(),
                    out.frame.index,
                    e
                );
            }
        }
        failed
    }

    /// Finish every sink in order. Each sink sees the fault counts of the
    /// sinks before it, so the summary (last) reports all of them.
    pub fn finish(&mut self, stats: &mut SummaryStats) {
        for i in 0..self.slots.len() {
            self.note_faults(stats);
            let slot = &mut self.slots[i];
            if let Err(e) = slot.sink.finish(stats) {
                slot.faults += 1;
                log::error!("sink {} failed to finish: {:#}", slot.sink.name(), e);
            }
        }
        self.note_faults(stats);
    }

    fn note_faults(&self, stats: &mut SummaryStats) {
        stats.sink_faults = self.fault_counts();
        if !stats.sink_faults.is_empty() && stats.status == "complete" {
            stats.status = "degraded".to_string();
        }
    }

    /// Fault count per sink name, sinks without faults omitted.
    pub fn fault_counts(&self) -> BTreeMap<String, u64> {
        self.slots
            .iter()
            .filter(|s| s.faults > 0)
            .map(|s| (s.sink.name().to_string(), s.faults))
            .collect()
    }
}
