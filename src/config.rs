use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_FRAME_SKIP: u64 = 5;
const DEFAULT_TRAIL_LEN: usize = 30;
const DEFAULT_FALLBACK_FPS: f64 = 30.0;
const DEFAULT_CONFIDENCE: f32 = 0.4;
const DEFAULT_IOU: f32 = 0.5;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_DETECTOR_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CLASSES: &[&str] = &["person", "excavator", "truck", "crane", "forklift", "loader"];
const DEFAULT_MATCH_IOU: f64 = 0.3;
const DEFAULT_PATIENCE_FRAMES: u64 = 30;
const DEFAULT_WARNING_M: f64 = 6.0;
const DEFAULT_CRITICAL_M: f64 = 3.0;
const DEFAULT_COLLISION_RADIUS_M: f64 = 1.0;
const DEFAULT_TTC_HORIZON_S: f64 = 3.0;
const DEFAULT_PERSON_CLASS: &str = "person";
const DEFAULT_ATTRIBUTES: &[&str] = &["hard_hat", "vest"];
const DEFAULT_CLASSIFIER_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_skip: Option<u64>,
    trail_len: Option<usize>,
    fallback_fps: Option<f64>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    spatial: Option<SpatialConfigFile>,
    compliance: Option<ComplianceConfigFile>,
    output: Option<OutputConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    input_size: Option<u32>,
    classes: Option<Vec<String>>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    match_iou: Option<f64>,
    patience_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SpatialConfigFile {
    warning_distance_m: Option<f64>,
    critical_distance_m: Option<f64>,
    collision_radius_m: Option<f64>,
    ttc_horizon_s: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ComplianceConfigFile {
    person_class: Option<String>,
    attributes: Option<Vec<String>>,
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    video: Option<bool>,
}

/// Run-wide pipeline settings. Loaded once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub frame_skip: u64,
    pub trail_len: usize,
    /// Frame rate used when the container does not report one.
    pub fallback_fps: f64,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub spatial: SpatialSettings,
    pub compliance: ComplianceSettings,
    pub write_video: bool,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub model_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
    pub classes: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub match_iou: f64,
    pub patience_frames: u64,
}

#[derive(Debug, Clone)]
pub struct SpatialSettings {
    pub warning_distance_m: f64,
    pub critical_distance_m: f64,
    pub collision_radius_m: f64,
    pub ttc_horizon_s: f64,
}

#[derive(Debug, Clone)]
pub struct ComplianceSettings {
    pub person_class: String,
    pub attributes: Vec<String>,
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Load from `path` (or `SITE_CONFIG`), then apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("SITE_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => PipelineConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let detector = file.detector.unwrap_or_default();
        let tracker = file.tracker.unwrap_or_default();
        let spatial = file.spatial.unwrap_or_default();
        let compliance = file.compliance.unwrap_or_default();
        Self {
            frame_skip: file.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
            trail_len: file.trail_len.unwrap_or(DEFAULT_TRAIL_LEN),
            fallback_fps: file.fallback_fps.unwrap_or(DEFAULT_FALLBACK_FPS),
            detector: DetectorSettings {
                model_path: detector.model_path,
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE),
                iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU),
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                classes: detector
                    .classes
                    .unwrap_or_else(|| to_strings(DEFAULT_CLASSES)),
                timeout: Duration::from_millis(
                    detector.timeout_ms.unwrap_or(DEFAULT_DETECTOR_TIMEOUT_MS),
                ),
            },
            tracker: TrackerSettings {
                match_iou: tracker.match_iou.unwrap_or(DEFAULT_MATCH_IOU),
                patience_frames: tracker.patience_frames.unwrap_or(DEFAULT_PATIENCE_FRAMES),
            },
            spatial: SpatialSettings {
                warning_distance_m: spatial.warning_distance_m.unwrap_or(DEFAULT_WARNING_M),
                critical_distance_m: spatial.critical_distance_m.unwrap_or(DEFAULT_CRITICAL_M),
                collision_radius_m: spatial
                    .collision_radius_m
                    .unwrap_or(DEFAULT_COLLISION_RADIUS_M),
                ttc_horizon_s: spatial.ttc_horizon_s.unwrap_or(DEFAULT_TTC_HORIZON_S),
            },
            compliance: ComplianceSettings {
                person_class: compliance
                    .person_class
                    .unwrap_or_else(|| DEFAULT_PERSON_CLASS.to_string()),
                attributes: compliance
                    .attributes
                    .unwrap_or_else(|| to_strings(DEFAULT_ATTRIBUTES)),
                endpoint: compliance.endpoint,
                timeout: Duration::from_millis(
                    compliance
                        .timeout_ms
                        .unwrap_or(DEFAULT_CLASSIFIER_TIMEOUT_MS),
                ),
            },
            write_video: file.output.and_then(|o| o.video).unwrap_or(true),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(skip) = std::env::var("SITE_FRAME_SKIP") {
            self.frame_skip = skip
                .trim()
                .parse()
                .map_err(|_| anyhow!("SITE_FRAME_SKIP must be a positive integer"))?;
        }
        if let Ok(len) = std::env::var("SITE_TRAIL_LEN") {
            self.trail_len = len
                .trim()
                .parse()
                .map_err(|_| anyhow!("SITE_TRAIL_LEN must be a positive integer"))?;
        }
        if let Ok(model) = std::env::var("SITE_DETECTOR_MODEL") {
            if !model.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(model));
            }
        }
        if let Ok(conf) = std::env::var("SITE_DETECTOR_CONFIDENCE") {
            self.detector.confidence_threshold = conf
                .trim()
                .parse()
                .map_err(|_| anyhow!("SITE_DETECTOR_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Ok(endpoint) = std::env::var("SITE_CLASSIFIER_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.compliance.endpoint = Some(endpoint.trim().to_string());
            }
        }
        if let Ok(attrs) = std::env::var("SITE_PPE_ATTRIBUTES") {
            let parsed = split_csv(&attrs);
            if !parsed.is_empty() {
                self.compliance.attributes = parsed;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_skip == 0 {
            return Err(anyhow!("frame_skip must be at least 1"));
        }
        if self.trail_len == 0 {
            return Err(anyhow!("trail_len must be at least 1"));
        }
        if !(self.fallback_fps.is_finite() && self.fallback_fps > 0.0) {
            return Err(anyhow!("fallback_fps must be positive"));
        }
        let det = &self.detector;
        if !(0.0..=1.0).contains(&det.confidence_threshold) {
            return Err(anyhow!("detector.confidence_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&det.iou_threshold) {
            return Err(anyhow!("detector.iou_threshold must be within [0, 1]"));
        }
        if det.classes.is_empty() {
            return Err(anyhow!("detector.classes must not be empty"));
        }
        if det.input_size == 0 || det.timeout.is_zero() {
            return Err(anyhow!("detector.input_size and detector.timeout_ms must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.tracker.match_iou) {
            return Err(anyhow!("tracker.match_iou must be within [0, 1]"));
        }
        let sp = &self.spatial;
        if !(sp.critical_distance_m > 0.0 && sp.critical_distance_m <= sp.warning_distance_m) {
            return Err(anyhow!(
                "spatial distances must satisfy 0 < critical_distance_m <= warning_distance_m"
            ));
        }
        if !(sp.collision_radius_m >= 0.0 && sp.collision_radius_m < sp.critical_distance_m) {
            return Err(anyhow!(
                "spatial.collision_radius_m must satisfy 0 <= collision_radius_m < critical_distance_m"
            ));
        }
        if !(sp.ttc_horizon_s > 0.0) {
            return Err(anyhow!("spatial.ttc_horizon_s must be > 0"));
        }
        let comp = &self.compliance;
        if comp.attributes.is_empty() || comp.attributes.iter().any(|a| a.trim().is_empty()) {
            return Err(anyhow!("compliance.attributes must be non-empty names"));
        }
        if comp.timeout.is_zero() {
            return Err(anyhow!("compliance.timeout_ms must be > 0"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
