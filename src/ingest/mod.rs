//! Frame ingestion.
//!
//! A source URL is classified into a [`SourceTarget`], opened through a
//! [`CaptureOpener`] into a [`CaptureBackend`], and driven by a
//! [`SourceReader`] that samples frames into the `frames` queue.
//!
//! Supported targets:
//! - `rtsp://` live camera streams (feature: capture-ffmpeg)
//! - `http(s)://` remote video files, downloaded before decoding (feature: capture-ffmpeg)
//! - local video file paths (feature: capture-ffmpeg)
//! - `stub://` synthetic sources (always available)

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::PipelineError;
use crate::frame::RawFrame;

mod download;
#[cfg(feature = "capture-ffmpeg")]
mod ffmpeg;
pub mod reader;
pub mod synthetic;

pub use download::download_to_tempfile;
pub use reader::{FrameSampler, ReaderExit, ReaderSettings, ReaderState, ReconnectPolicy, SourceReader};
pub use synthetic::{SyntheticCapture, SyntheticConfig};

/// An opened capture handle.
pub trait CaptureBackend: Send {
    /// Frame rate negotiated with the source, if it reported one.
    fn fps(&self) -> Option<f64>;

    /// Read the next frame.
    ///
    /// `EndOfStream` when the media ended; `Connection` for any other failure.
    fn read_frame(&mut self) -> Result<RawFrame, PipelineError>;
}

/// Opens capture handles for source targets.
///
/// `Connection` errors are retried by the reader. `Startup` means the target
/// can never be opened by this build and ends the source.
pub trait CaptureOpener: Send + Sync {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureBackend>, PipelineError>;
}

/// A classified source URL.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceTarget {
    Rtsp(String),
    /// HTTP(S) URL of a video file.
    Remote(String),
    File(PathBuf),
    Stub(SyntheticConfig),
}

fn remote_video_pattern() -> &'static Regex {
    static REMOTE_VIDEO_RE: OnceLock<Regex> = OnceLock::new();
    REMOTE_VIDEO_RE.get_or_init(|| {
        Regex::new(r"(?i)^https?://.+\.(mp4|avi|mov|wmv|flv|mkv)(\?.*)?$").unwrap()
    })
}

impl SourceTarget {
    /// Classify a source URL. Anything unrecognised is `InvalidSource`.
    pub fn parse(url: &str) -> Result<Self, PipelineError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidSource(url.to_string()));
        }
        if trimmed.starts_with("stub://") {
            return SyntheticConfig::from_url(trimmed).map(Self::Stub);
        }
        if trimmed.starts_with("rtsp://") {
            return if trimmed.len() > "rtsp://".len() {
                Ok(Self::Rtsp(trimmed.to_string()))
            } else {
                Err(PipelineError::InvalidSource(url.to_string()))
            };
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return if remote_video_pattern().is_match(trimmed) {
                Ok(Self::Remote(trimmed.to_string()))
            } else {
                Err(PipelineError::InvalidSource(url.to_string()))
            };
        }
        if trimmed.contains("://") {
            return Err(PipelineError::InvalidSource(url.to_string()));
        }
        let path = PathBuf::from(trimmed.strip_prefix("file:").unwrap_or(trimmed));
        if path.is_file() {
            Ok(Self::File(path))
        } else {
            Err(PipelineError::InvalidSource(url.to_string()))
        }
    }

    /// Live sources reconnect after end-of-stream; finite ones finish.
    pub fn is_live(&self) -> bool {
        match self {
            Self::Rtsp(_) => true,
            Self::Remote(_) | Self::File(_) => false,
            Self::Stub(config) => config.live,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Rtsp(url) | Self::Remote(url) => url.clone(),
            Self::File(path) => path.display().to_string(),
            Self::Stub(config) => format!("stub ({}x{})", config.width, config.height),
        }
    }
}

/// Opener used by the daemon: synthetic sources always, real media through
/// FFmpeg when compiled with `capture-ffmpeg`.
#[derive(Clone, Debug)]
pub struct DefaultCaptureOpener {
    io_timeout: Duration,
}

impl DefaultCaptureOpener {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

impl CaptureOpener for DefaultCaptureOpener {
    fn open(&self, target: &SourceTarget) -> Result<Box<dyn CaptureBackend>, PipelineError> {
        match target {
            SourceTarget::Stub(config) => Ok(Box::new(SyntheticCapture::new(config.clone()))),
            #[cfg(feature = "capture-ffmpeg")]
            SourceTarget::Rtsp(url) => Ok(Box::new(ffmpeg::FfmpegCapture::open_rtsp(
                url,
                self.io_timeout,
            )?)),
            #[cfg(feature = "capture-ffmpeg")]
            SourceTarget::File(path) => Ok(Box::new(ffmpeg::FfmpegCapture::open_file(path)?)),
            #[cfg(feature = "capture-ffmpeg")]
            SourceTarget::Remote(url) => {
                let download = download_to_tempfile(url, self.io_timeout)?;
                Ok(Box::new(ffmpeg::FfmpegCapture::open_download(download)?))
            }
            #[cfg(not(feature = "capture-ffmpeg"))]
            other => {
                let _ = self.io_timeout;
                Err(PipelineError::Startup(format!(
                    "{} requires the capture-ffmpeg feature",
                    other.describe()
                )))
            }
        }
    }
}
