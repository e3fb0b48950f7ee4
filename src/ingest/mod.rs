//! Frame ingestion.
//!
//! Frames come from a local video file (feature: video-ffmpeg) or from the
//! synthetic `stub://` source used by tests and the demo binary.
//!
//! The ingestion layer MUST NOT fetch remote URLs; network inference backends
//! live in their own stages.

pub mod file;
#[cfg(feature = "video-ffmpeg")]
pub(crate) mod file_ffmpeg;

pub use file::{FileSource, VideoInfo};
