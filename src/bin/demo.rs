//! demo - end-to-end synthetic run of the site processor.
//!
//! Writes a calibration and a zone file, scripts two workers walking toward
//! each other past a crane and an excavator, and runs the full pipeline on a
//! synthetic `stub://` video. One worker is scripted without a hard hat.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use site_processor::{
    BBox, Detection, Pipeline, PipelineConfig, RunInputs, ScriptedBackend, ScriptedPpeBackend,
};

#[path = "../ui.rs"]
mod ui;

const PIXELS_PER_METRE: f64 = 20.0;
const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the site processor on a synthetic scene")]
struct Args {
    /// Output directory.
    #[arg(long, default_value = "demo_out")]
    out: PathBuf,
    /// Number of synthetic frames.
    #[arg(long, default_value_t = 60)]
    frames: u64,
    /// Frames per second of the synthetic video.
    #[arg(long, default_value_t = 10.0)]
    fps: f64,
    /// Run detection on every Nth frame.
    #[arg(long, default_value_t = 2)]
    frame_skip: u64,
    /// Seed for the synthetic background.
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// UI mode: auto, plain, pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let (calibration, zones) = {
        let _stage = ui.stage("Write reference files");
        fs::create_dir_all(&args.out)
            .with_context(|| format!("create {}", args.out.display()))?;
        write_reference_files(&args.out)?
    };

    let mut config = PipelineConfig::load(None)?;
    config.frame_skip = args.frame_skip.max(1);

    let frames = ui.frames();
    let progress = frames.clone();
    let pipeline = Pipeline::new(config)
        .with_detector_backend(script_scene(args.frames))
        .with_ppe_backend(ScriptedPpeBackend::new().with_range(
            0..args.frames,
            2,
            &[("hard_hat", false), ("vest", true)],
        ).with_range(0..args.frames, 1, &[("hard_hat", true), ("vest", true)]))
        .with_progress(move |done, total| progress.set(done, total));

    let inputs = RunInputs {
        video: format!(
            "stub://demo?frames={}&fps={}&width={}&height={}&seed={}",
            args.frames, args.fps, WIDTH, HEIGHT, args.seed
        ),
        calibration,
        zones,
        out_dir: args.out.clone(),
    };
    let report = pipeline.run(&inputs)?;
    frames.finish();

    print!("{}", report.stats.render_text());
    println!("outputs written to {}", args.out.display());
    Ok(())
}

fn write_reference_files(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let s = 1.0 / PIXELS_PER_METRE;
    let calibration = serde_json::json!({
        "homography": [[s, 0.0, 0.0], [0.0, s, 0.0], [0.0, 0.0, 1.0]],
        "anchor": "bottom_center",
    });
    let zones = serde_json::json!({
        "zones": [
            {"name": "crane_radius", "polygon": [[18.0, 8.0], [30.0, 8.0], [30.0, 18.0], [18.0, 18.0]]},
            {"name": "material_store", "polygon": [[0.0, 0.0], [6.0, 0.0], [6.0, 6.0], [0.0, 6.0]]},
        ]
    });
    let calibration_path = dir.join("calibration.json");
    let zones_path = dir.join("zones.json");
    fs::write(&calibration_path, serde_json::to_vec_pretty(&calibration)?)
        .with_context(|| format!("write {}", calibration_path.display()))?;
    fs::write(&zones_path, serde_json::to_vec_pretty(&zones)?)
        .with_context(|| format!("write {}", zones_path.display()))?;
    Ok((calibration_path, zones_path))
}

/// Box standing on world point (`x_m`, `y_m`) with the given size in metres.
fn standing_box(x_m: f64, y_m: f64, w_m: f64, h_m: f64) -> BBox {
    let cx = x_m * PIXELS_PER_METRE;
    let by = y_m * PIXELS_PER_METRE;
    let hw = w_m * PIXELS_PER_METRE / 2.0;
    BBox::new(cx - hw, by - h_m * PIXELS_PER_METRE, cx + hw, by)
}

/// Two workers close from 14 m to 2 m apart; the excavator idles in the crane zone.
fn script_scene(frames: u64) -> ScriptedBackend {
    let mut backend = ScriptedBackend::new();
    let step = 6.0 / frames.max(1) as f64;
    for i in 0..frames {
        let d = step * i as f64;
        backend.insert(
            i,
            vec![
                Detection::new(0, "", standing_box(8.0 + d, 14.0, 0.8, 1.8), 0.91),
                Detection::new(0, "", standing_box(22.0 - d, 14.0, 0.8, 1.8), 0.88),
                Detection::new(1, "", standing_box(25.0, 11.0, 4.0, 3.0), 0.83),
            ],
        );
    }
    backend
}
