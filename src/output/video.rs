//! Annotated video: boxes, trails and per-frame event badges.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::event::{Event, EventKind, Presence, Severity};
use crate::output::{FrameOutput, Sink, SummaryStats};
use crate::track::Track;

const PALETTE: [[u8; 3]; 8] = [
    [46, 204, 113],
    [52, 152, 219],
    [155, 89, 182],
    [26, 188, 156],
    [241, 196, 15],
    [230, 126, 34],
    [149, 165, 166],
    [236, 240, 241],
];

const CRITICAL: Rgb<u8> = Rgb([220, 30, 30]);
const WARNING: Rgb<u8> = Rgb([255, 140, 0]);
const TTC: Rgb<u8> = Rgb([255, 220, 0]);
const ZONE: Rgb<u8> = Rgb([40, 100, 255]);
const PPE_MISSING: Rgb<u8> = Rgb([220, 0, 220]);

const BADGE_SIZE: u32 = 24;
const BADGE_GAP: i32 = 4;

/// Encodes annotated frames into a container.
pub trait FrameEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Uncompressed YUV4MPEG2 (4:4:4) writer.
pub struct Y4mEncoder {
    out: BufWriter<File>,
    width: u32,
    height: u32,
    plane: Vec<u8>,
}

impl Y4mEncoder {
    pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let (num, den) = fps_ratio(fps);
        writeln!(
            out,
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 C444",
            width, height, num, den
        )
        .with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            out,
            width,
            height,
            plane: Vec::with_capacity((width * height) as usize * 3),
        })
    }
}

impl FrameEncoder for Y4mEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<()> {
        if image.dimensions() != (self.width, self.height) {
            return Err(anyhow!(
                "frame is {}x{}, video is {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            ));
        }
        let n = (self.width * self.height) as usize;
        self.plane.clear();
        self.plane.resize(n * 3, 0);
        for (i, px) in image.pixels().enumerate() {
            let (y, u, v) = rgb_to_yuv(px.0);
            self.plane[i] = y;
            self.plane[n + i] = u;
            self.plane[2 * n + i] = v;
        }
        self.out.write_all(b"FRAME\n")?;
        self.out.write_all(&self.plane)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush().context("flush y4m output")
    }
}

/// BT.601 studio-swing conversion.
fn rgb_to_yuv([r, g, b]: [u8; 3]) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

fn fps_ratio(fps: f64) -> (u64, u64) {
    let num = (fps * 1000.0).round().max(1.0) as u64;
    let den = 1000;
    let g = gcd(num, den);
    (num / g, den / g)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(feature = "video-ffmpeg")]
mod mp4 {
    use super::FrameEncoder;
    use anyhow::{anyhow, Context, Result};
    use ffmpeg_next as ffmpeg;
    use image::RgbImage;
    use std::path::Path;

    /// H.264 (or MPEG-4 part 2 when H.264 is unavailable) MP4 encoder.
    pub struct FfmpegEncoder {
        output: ffmpeg::format::context::Output,
        encoder: ffmpeg::encoder::video::Encoder,
        scaler: ffmpeg::software::scaling::Context,
        stream_index: usize,
        time_base: ffmpeg::Rational,
        stream_time_base: ffmpeg::Rational,
        next_pts: i64,
        width: u32,
        height: u32,
    }

    impl FfmpegEncoder {
        pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self> {
            ffmpeg::init().context("initialize ffmpeg")?;
            let mut output = ffmpeg::format::output(&path)
                .with_context(|| format!("open {} for writing", path.display()))?;
            let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
                .or_else(|| ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4))
                .ok_or_else(|| anyhow!("no h264 or mpeg4 encoder available"))?;
            let global_header = output
                .format()
                .flags()
                .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

            let fps_milli = (fps * 1000.0).round().max(1.0) as i32;
            let time_base = ffmpeg::Rational::new(1000, fps_milli);
            let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
                .encoder()
                .video()
                .context("create video encoder")?;
            video.set_width(width);
            video.set_height(height);
            video.set_format(ffmpeg::format::Pixel::YUV420P);
            video.set_time_base(time_base);
            video.set_frame_rate(Some(ffmpeg::Rational::new(fps_milli, 1000)));
            if global_header {
                video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
            }
            let encoder = video.open_as(codec).context("open video encoder")?;

            let mut stream = output.add_stream(codec).context("add video stream")?;
            stream.set_time_base(time_base);
            stream.set_parameters(&encoder);
            let stream_index = stream.index();
            output.write_header().context("write mp4 header")?;
            let stream_time_base = output
                .stream(stream_index)
                .map(|s| s.time_base())
                .ok_or_else(|| anyhow!("video stream vanished after header"))?;

            let scaler = ffmpeg::software::scaling::Context::get(
                ffmpeg::format::Pixel::RGB24,
                width,
                height,
                ffmpeg::format::Pixel::YUV420P,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .context("create ffmpeg scaler")?;

            Ok(Self {
                output,
                encoder,
                scaler,
                stream_index,
                time_base,
                stream_time_base,
                next_pts: 0,
                width,
                height,
            })
        }

        fn drain(&mut self) -> Result<()> {
            let mut packet = ffmpeg::Packet::empty();
            while self.encoder.receive_packet(&mut packet).is_ok() {
                packet.set_stream(self.stream_index);
                packet.rescale_ts(self.time_base, self.stream_time_base);
                packet
                    .write_interleaved(&mut self.output)
                    .context("write video packet")?;
            }
            Ok(())
        }
    }

    impl FrameEncoder for FfmpegEncoder {
        fn encode(&mut self, image: &RgbImage) -> Result<()> {
            if image.dimensions() != (self.width, self.height) {
                return Err(anyhow!("frame size changed mid-stream"));
            }
            let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, self.width, self.height);
            let row = self.width as usize * 3;
            let stride = rgb.stride(0);
            let data = rgb.data_mut(0);
            for (y, src) in image.as_raw().chunks_exact(row).enumerate() {
                data[y * stride..y * stride + row].copy_from_slice(src);
            }
            let mut yuv = ffmpeg::frame::Video::empty();
            self.scaler.run(&rgb, &mut yuv).context("convert frame to yuv")?;
            yuv.set_pts(Some(self.next_pts));
            self.next_pts += 1;
            self.encoder.send_frame(&yuv).context("send frame to encoder")?;
            self.drain()
        }

        fn finish(&mut self) -> Result<()> {
            self.encoder.send_eof().context("flush encoder")?;
            self.drain()?;
            self.output.write_trailer().context("write mp4 trailer")
        }
    }
}

/// Renders each processed frame and hands it to the encoder.
pub struct AnnotatedVideoWriter {
    path: PathBuf,
    fps: f64,
    encoder: Option<Box<dyn FrameEncoder>>,
    frames: u64,
}

impl AnnotatedVideoWriter {
    pub fn create(dir: &Path, fps: f64) -> Result<Self> {
        let file_name = if cfg!(feature = "video-ffmpeg") {
            "annotated_video.mp4"
        } else {
            "annotated_video.y4m"
        };
        let path = dir.join(file_name);
        if !dir.is_dir() {
            return Err(anyhow!("output directory {} does not exist", dir.display()));
        }
        Ok(Self {
            path,
            fps,
            encoder: None,
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_encoder(&self, width: u32, height: u32) -> Result<Box<dyn FrameEncoder>> {
        #[cfg(feature = "video-ffmpeg")]
        {
            Ok(Box::new(mp4::FfmpegEncoder::create(&self.path, width, height, self.fps)?))
        }
        #[cfg(not(feature = "video-ffmpeg"))]
        {
            Ok(Box::new(Y4mEncoder::create(&self.path, width, height, self.fps)?))
        }
    }
}

impl Sink for AnnotatedVideoWriter {
    fn name(&self) -> &'static str {
        "annotated_video"
    }

    fn write_frame(&mut self, out: &FrameOutput<'_>) -> Result<()> {
        if self.encoder.is_none() {
            let encoder = self.open_encoder(out.frame.width(), out.frame.height())?;
            log::info!(
                "writing annotated video to {} ({}x{} @ {:.3} fps)",
                self.path.display(),
                out.frame.width(),
                out.frame.height(),
                self.fps
            );
            self.encoder = Some(encoder);
        }
        let image = annotate(out.frame.to_owned_image(), out.tracks, out.events);
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.encode(&image)?;
            self.frames += 1;
        }
        Ok(())
    }

    fn finish(&mut self, _stats: &SummaryStats) -> Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.finish()?;
                log::info!("annotated video: {} frames", self.frames);
                Ok(())
            }
            None => {
                log::info!("annotated video skipped: no frames");
                Ok(())
            }
        }
    }
}

fn track_color(id: u64) -> Rgb<u8> {
    Rgb(PALETTE[(id % PALETTE.len() as u64) as usize])
}

fn badge_color(event: &Event) -> Rgb<u8> {
    match &event.kind {
        EventKind::ProximityAlert {
            severity: Severity::Critical,
            ..
        } => CRITICAL,
        EventKind::ProximityAlert {
            severity: Severity::Warning,
            ..
        } => WARNING,
        EventKind::TtcWarning { .. } => TTC,
        EventKind::ZoneEntry { .. } => ZONE,
        EventKind::PpeObservation { .. } => PPE_MISSING,
    }
}

/// Whether an event deserves a badge. PPE only when something is missing.
fn is_alert(event: &Event) -> bool {
    !matches!(
        event.kind,
        EventKind::PpeObservation {
            present: Presence::Yes | Presence::Unknown,
            ..
        }
    )
}

/// Draw boxes, trails and badges for one frame.
pub fn annotate(mut image: RgbImage, tracks: &[Track], events: &[Event]) -> RgbImage {
    let alerts: Vec<&Event> = events.iter().filter(|e| is_alert(e)).collect();
    let offenders: BTreeSet<u64> = alerts.iter().flat_map(|e| e.track_ids()).collect();

    for track in tracks {
        let color = track_color(track.object_id());
        let points: Vec<(f32, f32)> = track
            .trail()
            .map(|p| (p.x_px as f32, p.y_px as f32))
            .collect();
        for pair in points.windows(2) {
            draw_line_segment_mut(&mut image, pair[0], pair[1], color);
        }

        let b = track.bbox();
        let w = b.width().round().max(1.0) as u32;
        let h = b.height().round().max(1.0) as u32;
        let x = b.x1.round() as i32;
        let y = b.y1.round() as i32;
        let thickness = if offenders.contains(&track.object_id()) { 3 } else { 1 };
        for t in 0..thickness {
            let rect = Rect::at(x - t, y - t).of_size(w + 2 * t as u32, h + 2 * t as u32);
            draw_hollow_rect_mut(&mut image, rect, color);
        }
    }

    let mut kinds: Vec<Rgb<u8>> = Vec::new();
    for event in alerts {
        let color = badge_color(event);
        if !kinds.contains(&color) {
            kinds.push(color);
        }
    }
    for (i, color) in kinds.into_iter().enumerate() {
        let x = BADGE_GAP + i as i32 * (BADGE_SIZE as i32 + BADGE_GAP);
        draw_filled_rect_mut(
            &mut image,
            Rect::at(x, BADGE_GAP).of_size(BADGE_SIZE, BADGE_SIZE),
            color,
        );
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn y4m_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.y4m");
        let mut enc = Y4mEncoder::create(&path, 3, 2, 25.0).unwrap();
        let image = RgbImage::from_pixel(3, 2, Rgb([255, 255, 255]));
        enc.encode(&image).unwrap();
        enc.encode(&image).unwrap();
        enc.finish().unwrap();
        assert!(enc.encode(&RgbImage::new(4, 4)).is_err());

        let bytes = std::fs::read(&path).unwrap();
        let header = b"YUV4MPEG2 W3 H2 F25:1 Ip A1:1 C444\n";
        assert!(bytes.starts_with(header));
        let frame_len = 6 + 3 * 2 * 3;
        assert_eq!(bytes.len(), header.len() + 2 * frame_len);
        // White maps to Y=235, U=V=128.
        assert_eq!(bytes[header.len() + 6], 235);
        assert_eq!(bytes[header.len() + 6 + 6], 128);
    }

    #[test]
    fn fractional_rates() {
        assert_eq!(fps_ratio(29.97), (2997, 100));
        assert_eq!(fps_ratio(30.0), (30, 1));
    }

    #[test]
    fn badges_only_for_alerts() {
        let ppe_ok = Event::new(
            0,
            0.0,
            EventKind::PpeObservation {
                track_id: 1,
                attribute: "vest".into(),
                present: Presence::Yes,
            },
        );
        let quiet = annotate(RgbImage::new(64, 64), &[], &[ppe_ok]);
        assert_eq!(quiet.get_pixel(10, 10), &Rgb([0, 0, 0]));

        let critical = Event::new(
            0,
            0.0,
            EventKind::ProximityAlert {
                track_ids: [1, 2],
                severity: Severity::Critical,
                distance_m: 1.0,
            },
        );
        let loud = annotate(RgbImage::new(64, 64), &[], &[critical]);
        assert_eq!(loud.get_pixel(10, 10), &CRITICAL);
    }

    #[test]
    fn sink_writes_on_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = AnnotatedVideoWriter::create(dir.path(), 10.0).unwrap();
        let frame = Frame::new(0, 10.0, RgbImage::new(8, 8));
        sink.write_frame(&FrameOutput {
            frame: &frame,
            tracks: &[],
            events: &[],
        })
        .unwrap();
        sink.finish(&SummaryStats::default()).unwrap();
        assert!(sink.path().exists());
    }
}
