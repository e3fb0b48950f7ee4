use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::output::{FrameOutput, Sink, SummaryStats, EVENTS_FILE, EVENT_LOG_SINK};

/// Append-only JSON Lines event log, flushed after every frame.
pub struct EventLogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: u64,
}

impl EventLogWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(EVENTS_FILE);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Sink for EventLogWriter {
    fn name(&self) -> &'static str {
        EVENT_LOG_SINK
    }

    fn write_frame(&mut self, out: &FrameOutput<'_>) -> Result<()> {
        if out.events.is_empty() {
            return Ok(());
        }
        // Serialize the whole frame first so a failure never leaves half a frame.
        let mut block = Vec::new();
        for event in out.events {
            serde_json::to_writer(&mut block, event).context("serialize event")?;
            block.push(b'\n');
        }
        self.out
            .write_all(&block)
            .and_then(|_| self.out.flush())
            .with_context(|| format!("append to {}", self.path.display()))?;
        self.written += out.events.len() as u64;
        Ok(())
    }

    fn finish(&mut self, stats: &SummaryStats) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        if self.written + stats.events_unwritten != stats.events_total {
            log::warn!(
                "event log holds {} of {} emitted events ({} reported unwritten)",
                self.written,
                stats.events_total,
                stats.events_unwritten
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind, Presence};
    use crate::frame::Frame;
    use crate::log::EventDigest;
    use image::RgbImage;

    #[test]
    fn lines_match_summary_digest() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EventLogWriter::create(dir.path()).unwrap();
        let mut stats = SummaryStats::default();
        for i in 0..3u64 {
            let frame = Frame::new(i, 10.0, RgbImage::new(2, 2));
            let events = vec![Event::new(
                i,
                frame.timestamp_s,
                EventKind::PpeObservation {
                    track_id: 1,
                    attribute: "vest".into(),
                    present: Presence::Yes,
                },
            )];
            events.iter().for_each(|e| stats.record(e));
            writer
                .write_frame(&FrameOutput {
                    frame: &frame,
                    tracks: &[],
                    events: &events,
                })
                .unwrap();
        }
        writer.finish(&stats).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
        let mut digest = EventDigest::new();
        for line in raw.lines() {
            let parsed: Event = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.type_tag(), "ppe_observation");
            digest.append(line.as_bytes());
        }
        assert_eq!(digest.records(), 3);
        assert_eq!(digest.hex(), stats.event_digest);
    }
}
