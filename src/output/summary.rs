use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::event::{Event, EventKind, Presence, Severity};
use crate::log::EventDigest;
use crate::output::{FrameOutput, Sink, SUMMARY_JSON_FILE, SUMMARY_TEXT_FILE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PpeTally {
    pub yes: u64,
    pub no: u64,
    pub unknown: u64,
}

impl PpeTally {
    /// `yes / (yes + no)`; `None` when nothing was actually checked.
    pub fn compliance_rate(&self) -> Option<f64> {
        let checked = self.yes + self.no;
        (checked > 0).then(|| self.yes as f64 / checked as f64)
    }
}

/// Run statistics. Every counter is a tally of emitted events; the rest is
/// run metadata filled in by the orchestrator.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SummaryStats {
    pub status: String,
    pub frames_processed: u64,
    pub video_duration_s: f64,
    pub wall_clock_s: f64,
    pub events_total: u64,
    pub proximity_warnings: u64,
    pub proximity_critical: u64,
    pub ttc_warnings: u64,
    pub zone_entries: BTreeMap<String, u64>,
    pub ppe: BTreeMap<String, PpeTally>,
    pub event_digest: String,
    /// Degraded stages, as `stage: reason`.
    pub degraded: Vec<String>,
    /// Per-frame faults by stage (decode errors, timeouts, backend errors).
    pub transient_faults: BTreeMap<String, u64>,
    /// Emitted events the event log failed to store.
    pub events_unwritten: u64,
    pub sink_faults: BTreeMap<String, u64>,
    #[serde(skip)]
    digest: EventDigest,
}

impl SummaryStats {
    pub fn record(&mut self, event: &Event) {
        self.events_total += 1;
        match &event.kind {
            EventKind::ProximityAlert { severity, .. } => match severity {
                Severity::Warning => self.proximity_warnings += 1,
                Severity::Critical => self.proximity_critical += 1,
            },
            EventKind::TtcWarning { .. } => self.ttc_warnings += 1,
            EventKind::ZoneEntry { zone, .. } => {
                *self.zone_entries.entry(zone.clone()).or_default() += 1;
            }
            EventKind::PpeObservation {
                attribute, present, ..
            } => {
                let tally = self.ppe.entry(attribute.clone()).or_default();
                match present {
                    Presence::Yes => tally.yes += 1,
                    Presence::No => tally.no += 1,
                    Presence::Unknown => tally.unknown += 1,
                }
            }
        }
        match serde_json::to_vec(event) {
            Ok(record) => {
                self.digest.append(&record);
                self.event_digest = self.digest.hex();
            }
            Err(e) => log::error!("frame {}: event not serializable: {}", event.frame, e),
        }
    }

    pub fn proximity_alerts(&self) -> u64 {
        self.proximity_warnings + self.proximity_critical
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "site processor run summary");
        let _ = writeln!(out, "status: {}", self.status);
        let _ = writeln!(out, "frames processed: {}", self.frames_processed);
        let _ = writeln!(out, "video duration: {:.3} s", self.video_duration_s);
        let _ = writeln!(out, "wall clock: {:.3} s", self.wall_clock_s);
        let _ = writeln!(out, "events: {}", self.events_total);
        let _ = writeln!(out, "proximity warnings: {}", self.proximity_warnings);
        let _ = writeln!(out, "proximity critical: {}", self.proximity_critical);
        let _ = writeln!(out, "ttc warnings: {}", self.ttc_warnings);
        let _ = writeln!(out, "zone entries:");
        if self.zone_entries.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for (zone, count) in &self.zone_entries {
            let _ = writeln!(out, "  {}: {}", zone, count);
        }
        let _ = writeln!(out, "ppe compliance:");
        if self.ppe.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for (attribute, tally) in &self.ppe {
            let rate = tally
                .compliance_rate()
                .map(|r| format!("{:.3}", r))
                .unwrap_or_else(|| "n/a".to_string());
            let _ = writeln!(
                out,
                "  {}: {} ({}/{} compliant, {} unknown)",
                attribute,
                rate,
                tally.yes,
                tally.yes + tally.no,
                tally.unknown
            );
        }
        let _ = writeln!(
            out,
            "event log sha256: {}",
            if self.event_digest.is_empty() {
                self.digest.hex()
            } else {
                self.event_digest.clone()
            }
        );
        let mut degraded = self.degraded.clone();
        degraded.extend(
            self.transient_faults
                .iter()
                .map(|(stage, n)| format!("{}: {} transient faults", stage, n)),
        );
        if self.events_unwritten > 0 {
            degraded.push(format!("event log: {} events unwritten", self.events_unwritten));
        }
        degraded.extend(
            self.sink_faults
                .iter()
                .map(|(sink, n)| format!("sink {}: {} faults", sink, n)),
        );
        if degraded.is_empty() {
            let _ = writeln!(out, "degraded: none");
        } else {
            let _ = writeln!(out, "degraded: {}", degraded.join("; "));
        }
        out
    }
}

/// Writes `summary.txt` and `summary.json` once, at the end of the run.
pub struct SummaryWriter {
    dir: PathBuf,
}

impl SummaryWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl Sink for SummaryWriter {
    fn name(&self) -> &'static str {
        "summary"
    }

    fn write_frame(&mut self, _out: &FrameOutput<'_>) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, stats: &SummaryStats) -> Result<()> {
        let text_path = self.dir.join(SUMMARY_TEXT_FILE);
        std::fs::write(&text_path, stats.render_text())
            .with_context(|| format!("write {}", text_path.display()))?;
        let json_path = self.dir.join(SUMMARY_JSON_FILE);
        let json = serde_json::to_vec_pretty(stats).context("serialize summary")?;
        std::fs::write(&json_path, json).with_context(|| format!("write {}", json_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ppe(track_id: u64, attribute: &str, present: Presence) -> Event {
        Event::new(
            3,
            0.1,
            EventKind::PpeObservation {
                track_id,
                attribute: attribute.to_string(),
                present,
            },
        )
    }

    #[test]
    fn tallies_and_rates() {
        let mut stats = SummaryStats::default();
        stats.record(&Event::new(
            1,
            0.0,
            EventKind::ProximityAlert {
                track_ids: [1, 2],
                severity: Severity::Critical,
                distance_m: 2.0,
            },
        ));
        stats.record(&Event::new(
            2,
            0.1,
            EventKind::ZoneEntry {
                track_id: 1,
                zone: "crane_radius".into(),
            },
        ));
        stats.record(&ppe(1, "hard_hat", Presence::Yes));
        stats.record(&ppe(1, "hard_hat", Presence::No));
        stats.record(&ppe(1, "hard_hat", Presence::Yes));
        stats.record(&ppe(1, "vest", Presence::Unknown));

        assert_eq!(stats.events_total, 6);
        assert_eq!(stats.proximity_alerts(), 1);
        assert_eq!(stats.zone_entries["crane_radius"], 1);
        let hat = stats.ppe["hard_hat"];
        assert!((hat.compliance_rate().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.ppe["vest"].compliance_rate(), None);

        let text = stats.render_text();
        assert!(text.contains("hard_hat: 0.667 (2/3 compliant, 0 unknown)"));
        assert!(text.contains("vest: n/a (0/0 compliant, 1 unknown)"));
        assert!(text.trim_end().ends_with("degraded: none"));
    }

    #[test]
    fn degraded_line_lists_stages_and_sinks() {
        let mut stats = SummaryStats::default();
        stats.degraded.push("detector: no detector model configured".into());
        stats.sink_faults.insert("annotated_video".into(), 3);
        let text = stats.render_text();
        let last = text.lines().last().unwrap();
        assert_eq!(
            last,
            "degraded: detector: no detector model configured; sink annotated_video: 3 faults"
        );
    }

    #[test]
    fn transient_faults_and_lost_events_are_listed() {
        let mut stats = SummaryStats::default();
        stats.transient_faults.insert("ingest".into(), 2);
        stats.transient_faults.insert("detector".into(), 1);
        stats.events_unwritten = 4;
        let text = stats.render_text();
        assert_eq!(
            text.lines().last().unwrap(),
            "degraded: detector: 1 transient faults; ingest: 2 transient faults; \
             event log: 4 events unwritten"
        );
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SummaryStats::default();
        stats.status = "complete".into();
        stats.record(&ppe(4, "vest", Presence::No));
        SummaryWriter::new(dir.path()).finish(&stats).unwrap();
        let text = std::fs::read_to_string(dir.path().join(SUMMARY_TEXT_FILE)).unwrap();
        assert!(text.contains("status: complete"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(SUMMARY_JSON_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["ppe"]["vest"]["no"], 1);
        assert_eq!(json["event_digest"].as_str().unwrap().len(), 64);
    }
}
