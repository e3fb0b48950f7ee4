//! Local video file decoding using FFmpeg.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next::format::{context::Input, Pixel};
use ffmpeg_next::frame::Video as VideoFrame;
use ffmpeg_next::software::scaling::{self, Flags};
use ffmpeg_next::{codec, media, Rational};
use image::RgbImage;
use std::path::Path;

use super::file::VideoInfo;

pub(crate) struct FfmpegFileSource {
    input: Input,
    video_stream: usize,
    decoder: codec::decoder::Video,
    to_rgb: scaling::Context,
    info: VideoInfo,
    drained: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &Path, fallback_fps: f64) -> Result<Self> {
        ffmpeg_next::init().context("ffmpeg init")?;
        let input = ffmpeg_next::format::input(&path)
            .with_context(|| format!("open video {}", path.display()))?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
        let video_stream = stream.index();
        let fps = stream_fps(stream.avg_frame_rate()).unwrap_or_else(|| {
            log::warn!(
                "{} reports no frame rate; assuming {} fps",
                path.display(),
                fallback_fps
            );
            fallback_fps
        });
        let frame_count = u64::try_from(stream.frames()).ok().filter(|n| *n > 0);
        let decoder = codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .with_context(|| format!("no usable decoder for {}", path.display()))?;
        let (width, height) = (decoder.width(), decoder.height());
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )
        .context("rgb converter")?;

        Ok(Self {
            input,
            video_stream,
            decoder,
            to_rgb,
            info: VideoInfo {
                fps,
                width,
                height,
                frame_count,
            },
            drained: false,
        })
    }

    pub(crate) fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Decode the next frame, `Ok(None)` once the decoder is drained.
    pub(crate) fn next_image(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = VideoFrame::empty();
        while self.decoder.receive_frame(&mut decoded).is_err() {
            if self.drained {
                return Ok(None);
            }
            self.feed()?;
        }
        let mut rgb = VideoFrame::empty();
        self.to_rgb
            .run(&decoded, &mut rgb)
            .context("convert decoded frame to rgb")?;
        rgb_image(&rgb).map(Some)
    }

    /// Push the next packet of the video stream, or EOF when the file ends.
    fn feed(&mut self) -> Result<()> {
        loop {
            let Some((stream, packet)) = self.input.packets().next() else {
                self.decoder.send_eof().context("flush decoder")?;
                self.drained = true;
                return Ok(());
            };
            if stream.index() == self.video_stream {
                return self.decoder.send_packet(&packet).context("decode packet");
            }
        }
    }
}

fn stream_fps(rate: Rational) -> Option<f64> {
    let fps = f64::from(rate);
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// Copy the packed RGB24 plane into an image, dropping the row padding.
fn rgb_image(frame: &VideoFrame) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let row = width as usize * 3;
    let stride = frame.stride(0);
    let plane = frame.data(0);
    if stride < row || plane.len() < stride * (height as usize).saturating_sub(1) + row {
        return Err(anyhow!("rgb plane too small for {}x{}", width, height));
    }
    let pixels: Vec<u8> = (0..height as usize)
        .flat_map(|y| &plane[y * stride..y * stride + row])
        .copied()
        .collect();
    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("decoded frame has an unexpected size"))
}
