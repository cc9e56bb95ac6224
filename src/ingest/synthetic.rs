//! Synthetic capture for `stub://` URLs.
//!
//! Query parameters:
//! - `fps`: reported frame rate (default 30, `0` reports no rate)
//! - `frames`: frames per connection before end-of-stream (default endless)
//! - `width`, `height`: frame size (default 320x240)
//! - `live`: reconnect after end-of-stream (default true)
//! - `realtime`: pace reads at `fps` instead of returning frames immediately
//!   (default false)

use std::thread;
use std::time::{Duration, Instant};

use url::Url;

use crate::error::PipelineError;
use crate::frame::RawFrame;

use super::CaptureBackend;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub fps: Option<f64>,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub live: bool,
    pub realtime: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            fps: Some(30.0),
            frames: None,
            width: 320,
            height: 240,
            live: true,
            realtime: false,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(raw: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidSource(raw.to_string());
        let url = Url::parse(raw).map_err(|_| invalid())?;
        if url.scheme() != "stub" {
            return Err(invalid());
        }

        let mut config = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "fps" => {
                    let fps: f64 = value.parse().map_err(|_| invalid())?;
                    if !fps.is_finite() || fps < 0.0 {
                        return Err(invalid());
                    }
                    config.fps = (fps > 0.0).then_some(fps);
                }
                "frames" => config.frames = Some(value.parse().map_err(|_| invalid())?),
                "width" => config.width = parse_dimension(&value).ok_or_else(invalid)?,
                "height" => config.height = parse_dimension(&value).ok_or_else(invalid)?,
                "live" => config.live = value.parse().map_err(|_| invalid())?,
                "realtime" => config.realtime = value.parse().map_err(|_| invalid())?,
                other => {
                    log::warn!("ignoring unknown stub parameter '{}' in {}", other, raw);
                }
            }
        }
        Ok(config)
    }
}

fn parse_dimension(value: &str) -> Option<u32> {
    value.parse().ok().filter(|v| (1..=8192).contains(v))
}

/// Generates a moving gradient. Each capture restarts its frame count, so a
/// reconnect replays the same sequence.
pub struct SyntheticCapture {
    config: SyntheticConfig,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticCapture {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            next_due: None,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let (width, height) = (self.config.width as u64, self.config.height as u64);
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + self.frame_count) % 256) as u8);
                pixels.push(((y + self.frame_count) % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        pixels
    }

    fn pace(&mut self) {
        let Some(fps) = self.config.fps else {
            return;
        };
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        let base = self.next_due.map_or(now, |due| due.max(now));
        self.next_due = Some(base + Duration::from_secs_f64(1.0 / fps));
    }
}

impl CaptureBackend for SyntheticCapture {
    fn fps(&self) -> Option<f64> {
        self.config.fps
    }

    fn read_frame(&mut self) -> Result<RawFrame, PipelineError> {
        if let Some(limit) = self.config.frames {
            if self.frame_count >= limit {
                return Err(PipelineError::EndOfStream);
            }
        }
        if self.config.realtime {
            self.pace();
        }
        self.frame_count += 1;
        RawFrame::new(self.generate_pixels(), self.config.width, self.config.height)
            .map_err(|e| PipelineError::connection("stub://", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_query() {
        assert_eq!(
            SyntheticConfig::from_url("stub://cam").unwrap(),
            SyntheticConfig::default()
        );
    }

    #[test]
    fn parses_query_parameters() {
        let config =
            SyntheticConfig::from_url("stub://lobby?fps=0&frames=12&width=64&height=48&live=false")
                .unwrap();
        assert_eq!(config.fps, None);
        assert_eq!(config.frames, Some(12));
        assert_eq!((config.width, config.height), (64, 48));
        assert!(!config.live);
    }

    #[test]
    fn rejects_bad_values() {
        for url in [
            "stub://cam?fps=abc",
            "stub://cam?fps=-1",
            "stub://cam?width=0",
            "stub://cam?live=maybe",
        ] {
            assert!(SyntheticConfig::from_url(url).is_err(), "{url}");
        }
    }

    #[test]
    fn finite_capture_ends_after_frame_limit() {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            frames: Some(3),
            width: 8,
            height: 8,
            ..SyntheticConfig::default()
        });
        for _ in 0..3 {
            let frame = capture.read_frame().unwrap();
            assert_eq!(frame.pixels().len(), 8 * 8 * 3);
        }
        assert!(matches!(
            capture.read_frame(),
            Err(PipelineError::EndOfStream)
        ));
        assert_eq!(capture.frames_read(), 3);
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            width: 4,
            height: 4,
            ..SyntheticConfig::default()
        });
        let a = capture.read_frame().unwrap();
        let b = capture.read_frame().unwrap();
        assert_ne!(a.pixels(), b.pixels());
    }

    #[test]
    fn realtime_capture_paces_reads() {
        let mut capture = SyntheticCapture::new(SyntheticConfig {
            fps: Some(50.0),
            width: 4,
            height: 4,
            realtime: true,
            ..SyntheticConfig::default()
        });
        let start = Instant::now();
        for _ in 0..6 {
            capture.read_frame().unwrap();
        }
        // five 20ms gaps after the first frame
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
