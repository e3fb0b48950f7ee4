use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::event::Presence;
use crate::output::{FrameOutput, Sink, SummaryStats, OBJECT_LOG_FILE};
use crate::track::Track;

const FIXED_COLUMNS: &[&str] = &[
    "frame",
    "timestamp_s",
    "object_id",
    "class",
    "x_px",
    "y_px",
    "w_px",
    "h_px",
    "x_m",
    "y_m",
    "vx_mps",
    "vy_mps",
    "in_zone",
];

/// One CSV row per (frame, active track).
pub struct ObjectLogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    attributes: Vec<String>,
}

impl ObjectLogWriter {
    pub fn create(dir: &Path, attributes: &[String]) -> Result<Self> {
        let path = dir.join(OBJECT_LOG_FILE);
        let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let header: Vec<String> = FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(attributes.iter().map(|a| csv_field(a)))
            .collect();
        writeln!(out, "{}", header.join(",")).with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            path,
            out,
            attributes: attributes.to_vec(),
        })
    }

    fn row(&self, frame: u64, timestamp_s: f64, track: &Track) -> String {
        let b = track.bbox();
        let mut cells = vec![
            frame.to_string(),
            format!("{:.3}", timestamp_s),
            track.object_id().to_string(),
            csv_field(track.class_name()),
            format!("{:.1}", b.x1),
            format!("{:.1}", b.y1),
            format!("{:.1}", b.width()),
            format!("{:.1}", b.height()),
            opt_num(track.world.map(|w| w.x_m)),
            opt_num(track.world.map(|w| w.y_m)),
            opt_num(track.velocity.map(|v| v.vx_mps)),
            opt_num(track.velocity.map(|v| v.vy_mps)),
            track.zone.as_deref().map(csv_field).unwrap_or_default(),
        ];
        for attribute in &self.attributes {
            let present = track
                .compliance
                .as_ref()
                .and_then(|c| c.get(attribute).copied())
                .unwrap_or(Presence::Unknown);
            cells.push(present.as_str().to_string());
        }
        cells.join(",")
    }
}

impl Sink for ObjectLogWriter {
    fn name(&self) -> &'static str {
        "object_log"
    }

    fn write_frame(&mut self, out: &FrameOutput<'_>) -> Result<()> {
        let mut block = String::new();
        for track in out.tracks {
            block.push_str(&self.row(out.frame.index, out.frame.timestamp_s, track));
            block.push('\n');
        }
        self.out
            .write_all(block.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))
    }

    fn finish(&mut self, _stats: &SummaryStats) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))
    }
}

fn opt_num(v: Option<f64>) -> String {
    v.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
