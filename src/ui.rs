use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

const SPINNER_TEMPLATE: &str = "{spinner} {msg}";
const FRAMES_UNBOUNDED: &str = "{spinner} {pos} frames ({per_sec})";
const FRAMES_BOUNDED: &str = "{bar:40} {pos}/{len} frames ({per_sec}, eta {eta})";

/// Terminal output for the binaries: spinners and a frame bar on a TTY,
/// plain `==>` lines otherwise.
#[derive(Clone, Copy, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let pretty = match ui_flag {
            Some("plain") => false,
            Some("pretty") | Some("auto") | None => is_tty,
            Some(other) => {
                log::warn!("unknown ui mode {:?}; using auto", other);
                is_tty
            }
        };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = self.pretty.then(|| {
            let spinner = stderr_bar(ProgressBar::new_spinner(), SPINNER_TEMPLATE);
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner.set_message(format!("{name}…"));
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
        }
    }

    /// Frame counter for the processing loop. Plain mode stays silent and
    /// leaves progress to the periodic log lines.
    pub fn frames(&self) -> FrameProgress {
        FrameProgress {
            bar: self
                .pretty
                .then(|| stderr_bar(ProgressBar::no_length(), FRAMES_UNBOUNDED)),
        }
    }
}

fn stderr_bar(bar: ProgressBar, template: &str) -> ProgressBar {
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_style(ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar()));
    bar
}

#[derive(Clone)]
pub struct FrameProgress {
    bar: Option<ProgressBar>,
}

impl FrameProgress {
    /// Switches to a bounded bar once the total frame count is known.
    pub fn set(&self, frames: u64, total: Option<u64>) {
        let Some(bar) = &self.bar else {
            return;
        };
        if let Some(total) = total.filter(|t| bar.length() != Some(*t)) {
            bar.set_length(total);
            bar.set_style(
                ProgressStyle::with_template(FRAMES_BOUNDED)
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        }
        bar.set_position(frames);
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, elapsed_label(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn elapsed_label(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}
