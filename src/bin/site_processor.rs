//! site_processor - process one construction-site video.
//!
//! Reads a video plus its calibration and zone files and writes the event log,
//! object log, annotated video and run summary into the output directory.
//!
//! Exit status: 0 complete, 3 degraded, 130 cancelled, 2 fatal input error,
//! 1 anything else.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use site_processor::{
    CancelToken, FatalError, Pipeline, PipelineConfig, RunInputs, RunStatus, ScriptedBackend,
    ScriptedPpeBackend,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Detect, track and analyse objects in a construction-site video"
)]
struct Args {
    /// Video file (or stub://name?frames=N&fps=F for a synthetic scene).
    #[arg(long)]
    video: String,

    /// Calibration JSON (pixel to world homography).
    #[arg(long)]
    calibration: PathBuf,

    /// Zones JSON (named world polygons).
    #[arg(long)]
    zones: PathBuf,

    /// Output directory, created if missing.
    #[arg(long)]
    out: PathBuf,

    /// Pipeline config (.toml or .json).
    #[arg(long, env = "SITE_CONFIG")]
    config: Option<PathBuf>,

    /// Replay detections from a JSON script instead of running a model.
    #[arg(long)]
    detections_script: Option<PathBuf>,

    /// Replay PPE answers from a JSON script instead of calling the classifier.
    #[arg(long)]
    ppe_script: Option<PathBuf>,

    /// Skip the annotated video.
    #[arg(long)]
    no_video: bool,

    /// UI mode: auto, plain, pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let mut config = {
        let _stage = ui.stage("Load configuration");
        PipelineConfig::load(args.config.as_deref())?
    };
    if args.no_video {
        config.write_video = false;
    }

    let mut pipeline = Pipeline::new(config);
    if let Some(path) = &args.detections_script {
        let backend = ScriptedBackend::load(path)?;
        pipeline = pipeline.with_detector_backend(backend);
    }
    if let Some(path) = &args.ppe_script {
        let backend = ScriptedPpeBackend::load(path)?;
        pipeline = pipeline.with_ppe_backend(backend);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received; finishing current frame");
        handler_token.cancel();
    })
    .context("install Ctrl-C handler")?;

    let frames = ui.frames();
    let progress = frames.clone();
    let pipeline = pipeline
        .with_cancel(cancel)
        .with_progress(move |done, total| progress.set(done, total));

    let inputs = RunInputs {
        video: args.video.clone(),
        calibration: args.calibration.clone(),
        zones: args.zones.clone(),
        out_dir: args.out.clone(),
    };
    let result = pipeline.run(&inputs);
    frames.finish();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(fatal) = e.downcast_ref::<FatalError>() {
                eprintln!("error: {}", fatal);
                return Ok(ExitCode::from(2));
            }
            return Err(e);
        }
    };

    println!(
        "{}: {} frames, {} events -> {}",
        report.status().as_str(),
        report.frames_processed,
        report.stats.events_total,
        args.out.display()
    );
    for line in report.stats.render_text().lines().filter(|l| l.starts_with("degraded:")) {
        println!("{}", line);
    }
    Ok(match report.status() {
        RunStatus::Complete => ExitCode::SUCCESS,
        RunStatus::Degraded => ExitCode::from(3),
        RunStatus::Cancelled => ExitCode::from(130),
    })
}
