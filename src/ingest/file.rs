//! Video file frame source.
//!
//! `FileSource` yields decoded frames in order with monotonic indices. A frame
//! that fails to decode is reported as an error and its index is consumed, so
//! timestamps of later frames stay aligned with the container.
//!
//! `stub://` paths select a deterministic synthetic scene for tests and demos:
//! `stub://name?frames=100&fps=10&width=640&height=360&seed=7&fail=3,9`.
//! `fail` lists frame indices that report a decode error.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::path::Path;

#[cfg(feature = "video-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::frame::Frame;

/// Stream properties known after opening.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Frame count reported by the container, if any.
    pub frame_count: Option<u64>,
}

impl VideoInfo {
    pub fn duration_s(&self) -> Option<f64> {
        self.frame_count.map(|n| n as f64 / self.fps)
    }
}

pub struct FileSource {
    backend: FileBackend,
    info: VideoInfo,
    next_index: u64,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "video-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    /// Open `path`. `fallback_fps` is used when the container has no usable rate.
    pub fn open(path: &str, fallback_fps: f64) -> Result<Self> {
        if !is_local_file_path(path) {
            return Err(anyhow!(
                "video input must be a local file path (no URL schemes): {}",
                path
            ));
        }
        if path.starts_with("stub://") {
            let source = SyntheticFileSource::parse(path)?;
            let info = source.info.clone();
            log::info!(
                "FileSource: {} (synthetic, {}x{} @ {} fps)",
                path,
                info.width,
                info.height,
                info.fps
            );
            return Ok(Self {
                backend: FileBackend::Synthetic(source),
                info,
                next_index: 0,
            });
        }
        let file = Path::new(path);
        std::fs::metadata(file).with_context(|| format!("video {} is not readable", path))?;
        #[cfg(feature = "video-ffmpeg")]
        {
            let source = FfmpegFileSource::open(file, fallback_fps)?;
            let info = source.info().clone();
            log::info!(
                "FileSource: {} (ffmpeg, {}x{} @ {:.3} fps)",
                path,
                info.width,
                info.height,
                info.fps
            );
            Ok(Self {
                backend: FileBackend::Ffmpeg(source),
                info,
                next_index: 0,
            })
        }
        #[cfg(not(feature = "video-ffmpeg"))]
        {
            let _ = fallback_fps;
            Err(anyhow!(
                "decoding {} requires the video-ffmpeg feature",
                file.display()
            ))
        }
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Frames consumed so far, including ones that failed to decode.
    pub fn frames_read(&self) -> u64 {
        self.next_index
    }

    /// Next frame, `Ok(None)` at end of stream.
    ///
    /// An error means one frame was lost; the caller may keep reading.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let index = self.next_index;
        let image = match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_image(index),
            #[cfg(feature = "video-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_image(),
        };
        match image {
            Ok(Some(image)) => {
                self.next_index += 1;
                Ok(Some(Frame::new(index, self.info.fps, image)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.next_index += 1;
                Err(e.context(format!("frame {} failed to decode", index)))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    info: VideoInfo,
    frames: u64,
    seed: u64,
    fail: BTreeSet<u64>,
}

impl SyntheticFileSource {
    fn parse(path: &str) -> Result<Self> {
        let mut source = Self {
            info: VideoInfo {
                fps: 10.0,
                width: 640,
                height: 360,
                frame_count: None,
            },
            frames: 100,
            seed: 0,
            fail: BTreeSet::new(),
        };
        let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub source parameter '{}' needs a value", pair))?;
            let bad = || anyhow!("stub source parameter {}={} is invalid", key, value);
            match key {
                "frames" => source.frames = value.parse().map_err(|_| bad())?,
                "fps" => source.info.fps = value.parse().map_err(|_| bad())?,
                "width" => source.info.width = value.parse().map_err(|_| bad())?,
                "height" => source.info.height = value.parse().map_err(|_| bad())?,
                "seed" => source.seed = value.parse().map_err(|_| bad())?,
                "fail" => {
                    for idx in value.split(',').filter(|v| !v.is_empty()) {
                        source.fail.insert(idx.parse().map_err(|_| bad())?);
                    }
                }
                other => return Err(anyhow!("unknown stub source parameter '{}'", other)),
            }
        }
        if !(source.info.fps.is_finite() && source.info.fps > 0.0) {
            return Err(anyhow!("stub source fps must be positive"));
        }
        if source.info.width == 0 || source.info.height == 0 {
            return Err(anyhow!("stub source dimensions must be positive"));
        }
        source.info.frame_count = Some(source.frames);
        Ok(source)
    }

    fn next_image(&mut self, index: u64) -> Result<Option<RgbImage>> {
        if index >= self.frames {
            return Ok(None);
        }
        if self.fail.contains(&index) {
            return Err(anyhow!("corrupt packet (synthetic)"));
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let (w, h) = (self.info.width, self.info.height);
        let image = RgbImage::from_fn(w, h, |_, y| {
            // Sky above the horizon, ground below, light sensor noise.
            let base: [u8; 3] = if y < h / 3 { [150, 180, 210] } else { [110, 100, 85] };
            let n: u8 = rng.gen_range(0..8);
            Rgb([base[0] + n, base[1] + n, base[2] + n])
        });
        Ok(Some(image))
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_source_honours_query() {
        let mut source = FileSource::open("stub://yard?frames=3&fps=5&width=8&height=6", 30.0).unwrap();
        assert_eq!(
            source.info(),
            &VideoInfo {
                fps: 5.0,
                width: 8,
                height: 6,
                frame_count: Some(3)
            }
        );
        let mut stamps = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.width(), 8);
            stamps.push((frame.index, frame.timestamp_s));
        }
        assert_eq!(stamps, vec![(0, 0.0), (1, 0.2), (2, 0.4)]);
    }

    #[test]
    fn decode_failure_consumes_index() {
        let mut source = FileSource::open("stub://x?frames=3&width=4&height=4&fail=1", 30.0).unwrap();
        assert_eq!(source.next_frame().unwrap().unwrap().index, 0);
        assert!(source.next_frame().is_err());
        assert_eq!(source.next_frame().unwrap().unwrap().index, 2);
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.frames_read(), 3);
    }

    #[test]
    fn synthetic_frames_are_deterministic() {
        let mut a = FileSource::open("stub://x?frames=2&width=16&height=16&seed=4", 30.0).unwrap();
        let mut b = FileSource::open("stub://x?frames=2&width=16&height=16&seed=4", 30.0).unwrap();
        let fa = a.next_frame().unwrap().unwrap();
        let fb = b.next_frame().unwrap().unwrap();
        assert_eq!(fa.image(), fb.image());
    }

    #[test]
    fn rejects_remote_and_missing_inputs() {
        assert!(FileSource::open("rtsp://camera/stream", 30.0).is_err());
        assert!(FileSource::open("", 30.0).is_err());
        assert!(FileSource::open("/definitely/not/here.mp4", 30.0).is_err());
        assert!(FileSource::open("stub://x?bogus=1", 30.0).is_err());
    }
}
