//! Source reader connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Reconnecting -> Connecting ...
//!                                    |
//!                                    +-> Stopped (stop signal, or end of a finite source)
//! ```
//!
//! A live source never gives up: open and read failures loop through
//! `Reconnecting` with a capped linear backoff until the source is stopped.

use std::sync::Arc;
use std::time::Duration;

use crate::broker::Queue;
use crate::error::PipelineError;
use crate::frame::DEFAULT_JPEG_QUALITY;
use crate::record::FrameRecord;
use crate::registry::{SourceRegistry, SourceStatus};
use crate::shutdown::StopSignal;

use super::{CaptureBackend, CaptureOpener, SourceTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Why a reader stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stop signal fired.
    Stopped,
    /// A finite source reached end-of-stream.
    Finished,
    /// The source can never be opened.
    Failed(String),
}

/// `delay(attempt) = min(cap, step * attempt)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub step: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }
}

/// Passes one of every `frames_to_skip` successful reads.
#[derive(Clone, Debug)]
pub struct FrameSampler {
    frames_to_skip: u64,
    count: u64,
}

impl FrameSampler {
    pub fn new(source_fps: f64, target_rate: f64) -> Self {
        Self {
            frames_to_skip: Self::frames_to_skip(source_fps, target_rate),
            count: 0,
        }
    }

    /// `max(1, round(fps / rate))`
    pub fn frames_to_skip(source_fps: f64, target_rate: f64) -> u64 {
        let ratio = (source_fps / target_rate).round();
        if ratio.is_finite() && ratio >= 1.0 {
            ratio as u64
        } else {
            1
        }
    }

    pub fn skip(&self) -> u64 {
        self.frames_to_skip
    }

    /// Count one successful read; true when it should be enqueued.
    pub fn accept(&mut self) -> bool {
        self.count += 1;
        self.count % self.frames_to_skip == 0
    }
}

#[derive(Clone, Debug)]
pub struct ReaderSettings {
    pub target_sample_rate: f64,
    pub default_fps: f64,
    pub reconnect: ReconnectPolicy,
    pub jpeg_quality: u8,
    /// Consecutive reconnect attempts logged at warn before escalating to error.
    pub escalate_after: u32,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            target_sample_rate: 5.0,
            default_fps: 30.0,
            reconnect: ReconnectPolicy::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            escalate_after: 5,
        }
    }
}

pub struct SourceReader {
    source_id: String,
    target: SourceTarget,
    debug: bool,
    opener: Arc<dyn CaptureOpener>,
    frames: Arc<Queue>,
    settings: ReaderSettings,
    stop: StopSignal,
    state: ReaderState,
    capture: Option<Box<dyn CaptureBackend>>,
    sampler: FrameSampler,
    attempt: u32,
    last_delay: Option<Duration>,
    enqueued: u64,
    exit: Option<ReaderExit>,
}

impl SourceReader {
    pub fn new(
        source_id: impl Into<String>,
        target: SourceTarget,
        debug: bool,
        opener: Arc<dyn CaptureOpener>,
        frames: Arc<Queue>,
        settings: ReaderSettings,
        stop: StopSignal,
    ) -> Self {
        let sampler = FrameSampler::new(settings.default_fps, settings.target_sample_rate);
        Self {
            source_id: source_id.into(),
            target,
            debug,
            opener,
            frames,
            settings,
            stop,
            state: ReaderState::Disconnected,
            capture: None,
            sampler,
            attempt: 0,
            last_delay: None,
            enqueued: 0,
            exit: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Consecutive reconnect attempts since the last successful read.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Backoff slept by the most recent reconnect.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn frames_enqueued(&self) -> u64 {
        self.enqueued
    }

    pub fn sampler(&self) -> &FrameSampler {
        &self.sampler
    }

    /// Drive the state machine until it stops, keeping the registry current.
    pub fn run(mut self, registry: &SourceRegistry) -> ReaderExit {
        if let Err(e) = registry.mark_running(&self.source_id) {
            log::warn!("{}: {}", self.source_id, e);
        }
        log::info!("{}: reading {}", self.source_id, self.target.describe());

        while self.state != ReaderState::Stopped {
            self.step();
        }
        let exit = self.exit.take().unwrap_or(ReaderExit::Stopped);

        let recorded = match &exit {
            ReaderExit::Failed(reason) => registry.set_error(&self.source_id, reason.clone()),
            ReaderExit::Stopped | ReaderExit::Finished => {
                registry.update_status(&self.source_id, SourceStatus::Stopped)
            }
        };
        if let Err(e) = recorded {
            log::warn!("{}: {}", self.source_id, e);
        }
        log::info!(
            "{}: reader exited ({:?}) after enqueuing {} frames",
            self.source_id,
            exit,
            self.enqueued
        );
        exit
    }

    /// Perform one transition (or, while streaming, one frame read).
    pub fn step(&mut self) -> ReaderState {
        if self.state != ReaderState::Stopped && self.stop.is_triggered() {
            self.finish(ReaderExit::Stopped);
            return self.state;
        }

        match self.state {
            ReaderState::Disconnected => self.state = ReaderState::Connecting,
            ReaderState::Connecting => self.connect(),
            ReaderState::Streaming => self.read_one(),
            ReaderState::Reconnecting => self.back_off(),
            ReaderState::Stopped => {}
        }
        self.state
    }

    fn connect(&mut self) {
        match self.opener.open(&self.target) {
            Ok(capture) => {
                let fps = match capture.fps() {
                    Some(fps) if fps.is_finite() && fps > 0.0 => fps,
                    _ => {
                        log::warn!(
                            "{}: source reported no usable frame rate; assuming {}",
                            self.source_id,
                            self.settings.default_fps
                        );
                        self.settings.default_fps
                    }
                };
                self.sampler = FrameSampler::new(fps, self.settings.target_sample_rate);
                log::info!(
                    "{}: connected at {:.2} fps, keeping 1 frame in {}",
                    self.source_id,
                    fps,
                    self.sampler.skip()
                );
                self.capture = Some(capture);
                self.state = ReaderState::Streaming;
            }
            Err(PipelineError::Startup(reason)) | Err(PipelineError::InvalidSource(reason)) => {
                log::error!("{}: cannot open source: {}", self.source_id, reason);
                self.finish(ReaderExit::Failed(reason));
            }
            Err(e) => {
                self.log_failure(&format!("open failed: {}", e));
                self.state = ReaderState::Reconnecting;
            }
        }
    }

    fn read_one(&mut self) {
        let Some(capture) = self.capture.as_mut() else {
            self.state = ReaderState::Connecting;
            return;
        };
        match capture.read_frame() {
            Ok(frame) => {
                self.attempt = 0;
                if !self.sampler.accept() {
                    return;
                }
                let encoded = frame
                    .encode_jpeg(self.settings.jpeg_quality)
                    .map_err(|e| PipelineError::malformed(format!("{:#}", e)))
                    .and_then(|image| {
                        FrameRecord {
                            source_id: self.source_id.clone(),
                            timestamp: crate::now_s(),
                            debug: self.debug,
                            image,
                        }
                        .encode()
                    });
                match encoded {
                    Ok(bytes) => {
                        self.frames.push(bytes);
                        self.enqueued += 1;
                    }
                    Err(e) => log::warn!("{}: dropping sampled frame: {}", self.source_id, e),
                }
            }
            Err(PipelineError::EndOfStream) if !self.target.is_live() => {
                log::info!("{}: end of stream", self.source_id);
                self.finish(ReaderExit::Finished);
            }
            Err(e) => {
                self.log_failure(&format!("read failed: {}", e));
                self.state = ReaderState::Reconnecting;
            }
        }
    }

    fn back_off(&mut self) {
        self.capture = None;
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.settings.reconnect.delay(self.attempt);
        self.last_delay = Some(delay);
        let message = format!(
            "{}: reconnect attempt {} in {:?}",
            self.source_id, self.attempt, delay
        );
        if self.attempt > self.settings.escalate_after {
            log::error!("{}", message);
        } else {
            log::warn!("{}", message);
        }

        if self.stop.wait_timeout(delay) {
            self.finish(ReaderExit::Stopped);
        } else {
            self.state = ReaderState::Connecting;
        }
    }

    fn log_failure(&self, what: &str) {
        if self.attempt >= self.settings.escalate_after {
            log::error!("{}: {}", self.source_id, what);
        } else {
            log::warn!("{}: {}", self.source_id, what);
        }
    }

    fn finish(&mut self, exit: ReaderExit) {
        self.capture = None;
        self.exit = Some(exit);
        self.state = ReaderState::Stopped;
    }
}
