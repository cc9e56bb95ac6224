use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::broker::QueueSpec;
use crate::frame::DEFAULT_JPEG_QUALITY;

const DEFAULT_DB_PATH: &str = "facestream.db";
const DEFAULT_FRAMES_QUEUE: &str = "frames";
const DEFAULT_FACES_QUEUE: &str = "faces";
const DEFAULT_RECOGNITION_QUEUE: &str = "recognition";
const DEFAULT_MAX_FRAMES_QUEUE: usize = 100;
const DEFAULT_MAX_FACES_QUEUE: usize = 200;
const DEFAULT_MAX_RECOGNITION_QUEUE: usize = 200;
const DEFAULT_MAX_RESULTS: usize = 1000;
const DEFAULT_RESULT_TTL_SECS: u64 = 3600;
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 3600;
const DEFAULT_TRIM_INTERVAL_SECS: u64 = 60;
const DEFAULT_SAMPLE_RATE: f64 = 5.0;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_RECONNECT_STEP_SECS: u64 = 2;
const DEFAULT_RECONNECT_CAP_SECS: u64 = 30;
const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.4;
const DEFAULT_DETECTION_IOU: f32 = 0.5;
const DEFAULT_MIN_FACE_WIDTH: i32 = 100;
const DEFAULT_DEBUG_MIN_FACE_WIDTH: i32 = 50;
const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
const DEFAULT_POP_TIMEOUT_MS: u64 = 1000;
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 2;
const MAX_GOVERNOR_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(3600);
const MAX_IO_TIMEOUT: Duration = Duration::from_secs(3600);
const MAX_JOIN_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    db_path: Option<String>,
    sources: Option<Vec<String>>,
    queues: Option<QueuesConfigFile>,
    store: Option<StoreConfigFile>,
    ingest: Option<IngestConfigFile>,
    detection: Option<DetectionConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    aggregation: Option<AggregationConfigFile>,
    pop_timeout_ms: Option<u64>,
    join_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct QueuesConfigFile {
    frames: Option<QueueConfigFile>,
    faces: Option<QueueConfigFile>,
    recognition: Option<QueueConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    name: Option<String>,
    max_len: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    max_results: Option<usize>,
    result_ttl_secs: Option<u64>,
    flush_interval_secs: Option<u64>,
    trim_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    target_sample_rate: Option<f64>,
    default_fps: Option<f64>,
    reconnect_step_secs: Option<u64>,
    reconnect_cap_secs: Option<u64>,
    io_timeout_secs: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence: Option<f32>,
    iou: Option<f32>,
    min_face_width: Option<i32>,
    debug_min_face_width: Option<i32>,
    debug_mode: Option<bool>,
    workers: Option<usize>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    similarity_threshold: Option<f64>,
    workers: Option<usize>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct AggregationConfigFile {
    workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    /// Sources started when the daemon boots.
    pub sources: Vec<String>,
    pub queues: QueueSettings,
    pub store: StoreSettings,
    pub ingest: IngestSettings,
    pub detection: DetectionConfig,
    pub recognition: RecognitionConfig,
    pub aggregation_workers: usize,
    pub pop_timeout: Duration,
    pub join_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub frames: QueueSpec,
    pub faces: QueueSpec,
    pub recognition: QueueSpec,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_results: usize,
    pub result_ttl: Duration,
    pub flush_interval: Duration,
    pub trim_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub target_sample_rate: f64,
    pub default_fps: f64,
    pub reconnect_step: Duration,
    pub reconnect_cap: Duration,
    pub io_timeout: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub confidence: f32,
    pub iou: f32,
    pub min_face_width: i32,
    pub debug_min_face_width: i32,
    pub debug_mode: bool,
    /// Detection worker threads. They share one detector behind a lock, so
    /// extra workers overlap only frame decoding, cropping and JPEG encoding;
    /// inference itself runs one frame at a time.
    pub workers: usize,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub similarity_threshold: f64,
    /// Recognition worker threads. Feature extraction is serialised the same
    /// way as detection.
    pub workers: usize,
    pub model_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Optional JSON file named by `FACESTREAM_CONFIG`, then `FACESTREAM_*`
    /// environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACESTREAM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let queues = file.queues.unwrap_or_default();
        let queue = |q: Option<QueueConfigFile>, name: &str, max_len: usize| {
            let q = q.unwrap_or_default();
            QueueSpec::new(
                q.name.unwrap_or_else(|| name.to_string()),
                q.max_len.unwrap_or(max_len),
            )
        };
        let store = file.store.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            sources: file.sources.unwrap_or_default(),
            queues: QueueSettings {
                frames: queue(queues.frames, DEFAULT_FRAMES_QUEUE, DEFAULT_MAX_FRAMES_QUEUE),
                faces: queue(queues.faces, DEFAULT_FACES_QUEUE, DEFAULT_MAX_FACES_QUEUE),
                recognition: queue(
                    queues.recognition,
                    DEFAULT_RECOGNITION_QUEUE,
                    DEFAULT_MAX_RECOGNITION_QUEUE,
                ),
            },
            store: StoreSettings {
                max_results: store.max_results.unwrap_or(DEFAULT_MAX_RESULTS),
                result_ttl: Duration::from_secs(
                    store.result_ttl_secs.unwrap_or(DEFAULT_RESULT_TTL_SECS),
                ),
                flush_interval: Duration::from_secs(
                    store.flush_interval_secs.unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
                ),
                trim_interval: Duration::from_secs(
                    store.trim_interval_secs.unwrap_or(DEFAULT_TRIM_INTERVAL_SECS),
                ),
            },
            ingest: IngestSettings {
                target_sample_rate: ingest.target_sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
                default_fps: ingest.default_fps.unwrap_or(DEFAULT_FPS),
                reconnect_step: Duration::from_secs(
                    ingest.reconnect_step_secs.unwrap_or(DEFAULT_RECONNECT_STEP_SECS),
                ),
                reconnect_cap: Duration::from_secs(
                    ingest.reconnect_cap_secs.unwrap_or(DEFAULT_RECONNECT_CAP_SECS),
                ),
                io_timeout: Duration::from_secs(
                    ingest.io_timeout_secs.unwrap_or(DEFAULT_IO_TIMEOUT_SECS),
                ),
                jpeg_quality: ingest.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            detection: DetectionConfig {
                confidence: detection.confidence.unwrap_or(DEFAULT_DETECTION_CONFIDENCE),
                iou: detection.iou.unwrap_or(DEFAULT_DETECTION_IOU),
                min_face_width: detection.min_face_width.unwrap_or(DEFAULT_MIN_FACE_WIDTH),
                debug_min_face_width: detection
                    .debug_min_face_width
                    .unwrap_or(DEFAULT_DEBUG_MIN_FACE_WIDTH),
                debug_mode: detection.debug_mode.unwrap_or(false),
                workers: detection.workers.unwrap_or(1),
                model_path: detection.model_path,
            },
            recognition: RecognitionConfig {
                similarity_threshold: recognition
                    .similarity_threshold
                    .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
                workers: recognition.workers.unwrap_or(1),
                model_path: recognition.model_path,
            },
            aggregation_workers: file.aggregation.and_then(|a| a.workers).unwrap_or(1),
            pop_timeout: Duration::from_millis(file.pop_timeout_ms.unwrap_or(DEFAULT_POP_TIMEOUT_MS)),
            join_timeout: Duration::from_secs(
                file.join_timeout_secs.unwrap_or(DEFAULT_JOIN_TIMEOUT_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FACESTREAM_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(sources) = std::env::var("FACESTREAM_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
        if let Some(v) = env_parse("FACESTREAM_MAX_FRAMES_QUEUE_SIZE")? {
            self.queues.frames.max_len = v;
        }
        if let Some(v) = env_parse("FACESTREAM_MAX_FACES_QUEUE_SIZE")? {
            self.queues.faces.max_len = v;
        }
        if let Some(v) = env_parse("FACESTREAM_MAX_RECOGNITION_QUEUE_SIZE")? {
            self.queues.recognition.max_len = v;
        }
        if let Some(v) = env_parse("FACESTREAM_MAX_RESULTS_STORE_SIZE")? {
            self.store.max_results = v;
        }
        if let Some(v) = env_parse("FACESTREAM_RESULT_TTL_SECS")? {
            self.store.result_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("FACESTREAM_QUEUE_FLUSH_INTERVAL")? {
            self.store.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("FACESTREAM_TRIM_INTERVAL_SECS")? {
            self.store.trim_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("FACESTREAM_FRAME_SAMPLE_RATE")? {
            self.ingest.target_sample_rate = v;
        }
        if let Some(v) = env_parse("FACESTREAM_RECONNECT_CAP_SECS")? {
            self.ingest.reconnect_cap = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("FACESTREAM_IO_TIMEOUT_SECS")? {
            self.ingest.io_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("FACESTREAM_FACE_DETECTION_CONFIDENCE")? {
            self.detection.confidence = v;
        }
        if let Some(v) = env_parse("FACESTREAM_FACE_DETECTION_IOU")? {
            self.detection.iou = v;
        }
        if let Some(v) = env_parse("FACESTREAM_MIN_FACE_WIDTH")? {
            self.detection.min_face_width = v;
        }
        if let Some(v) = env_parse("FACESTREAM_DEBUG_MIN_FACE_WIDTH")? {
            self.detection.debug_min_face_width = v;
        }
        if let Ok(v) = std::env::var("FACESTREAM_DEBUG_MODE") {
            if !v.trim().is_empty() {
                self.detection.debug_mode = parse_bool(&v)
                    .ok_or_else(|| anyhow!("FACESTREAM_DEBUG_MODE must be true or false"))?;
            }
        }
        if let Some(v) = env_parse("FACESTREAM_DETECTION_WORKERS")? {
            self.detection.workers = v;
        }
        if let Ok(path) = std::env::var("FACESTREAM_DETECTION_MODEL") {
            if !path.trim().is_empty() {
                self.detection.model_path = Some(PathBuf::from(path));
            }
        }
        if let Some(v) = env_parse("FACESTREAM_SIMILARITY_THRESHOLD")? {
            self.recognition.similarity_threshold = v;
        }
        if let Some(v) = env_parse("FACESTREAM_RECOGNITION_WORKERS")? {
            self.recognition.workers = v;
        }
        if let Ok(path) = std::env::var("FACESTREAM_RECOGNITION_MODEL") {
            if !path.trim().is_empty() {
                self.recognition.model_path = Some(PathBuf::from(path));
            }
        }
        if let Some(v) = env_parse("FACESTREAM_AGGREGATION_WORKERS")? {
            self.aggregation_workers = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for queue in [&self.queues.frames, &self.queues.faces, &self.queues.recognition] {
            if queue.name.trim().is_empty() {
                return Err(anyhow!("queue names must not be empty"));
            }
            if queue.max_len == 0 {
                return Err(anyhow!("queue '{}' max_len must be greater than zero", queue.name));
            }
        }
        if self.queues.frames.name == self.queues.faces.name
            || self.queues.frames.name == self.queues.recognition.name
            || self.queues.faces.name == self.queues.recognition.name
        {
            return Err(anyhow!("queue names must be distinct"));
        }
        if self.store.max_results == 0 {
            return Err(anyhow!("store max_results must be greater than zero"));
        }
        if self.store.result_ttl.is_zero() {
            return Err(anyhow!("result TTL must be greater than zero"));
        }
        if self.store.flush_interval.is_zero() || self.store.trim_interval.is_zero() {
            return Err(anyhow!("governor intervals must be greater than zero"));
        }
        if self.store.flush_interval > MAX_GOVERNOR_INTERVAL
            || self.store.trim_interval > MAX_GOVERNOR_INTERVAL
        {
            return Err(anyhow!(
                "governor intervals must not exceed {}s",
                MAX_GOVERNOR_INTERVAL.as_secs()
            ));
        }
        if !(self.ingest.target_sample_rate.is_finite() && self.ingest.target_sample_rate > 0.0) {
            return Err(anyhow!("target sample rate must be a positive number"));
        }
        if !(self.ingest.default_fps.is_finite() && self.ingest.default_fps > 0.0) {
            return Err(anyhow!("default fps must be a positive number"));
        }
        if self.ingest.reconnect_step.is_zero() || self.ingest.reconnect_cap.is_zero() {
            return Err(anyhow!("reconnect step and cap must be greater than zero"));
        }
        if self.ingest.reconnect_step > self.ingest.reconnect_cap {
            return Err(anyhow!("reconnect step must not exceed the reconnect cap"));
        }
        if self.ingest.reconnect_cap > MAX_RECONNECT_DELAY {
            return Err(anyhow!(
                "reconnect cap must not exceed {}s",
                MAX_RECONNECT_DELAY.as_secs()
            ));
        }
        if self.ingest.io_timeout.is_zero() || self.ingest.io_timeout > MAX_IO_TIMEOUT {
            return Err(anyhow!(
                "I/O timeout must be greater than zero and at most {}s",
                MAX_IO_TIMEOUT.as_secs()
            ));
        }
        if !(1..=100).contains(&self.ingest.jpeg_quality) {
            return Err(anyhow!("JPEG quality must be between 1 and 100"));
        }
        check_unit("detection confidence", f64::from(self.detection.confidence))?;
        check_unit("detection IoU", f64::from(self.detection.iou))?;
        check_unit("similarity threshold", self.recognition.similarity_threshold)?;
        if self.detection.min_face_width < 1 || self.detection.debug_min_face_width < 1 {
            return Err(anyhow!("minimum face widths must be at least 1 pixel"));
        }
        if self.detection.debug_min_face_width > self.detection.min_face_width {
            return Err(anyhow!(
                "debug minimum face width ({}) must not exceed the normal minimum ({})",
                self.detection.debug_min_face_width,
                self.detection.min_face_width
            ));
        }
        if self.detection.workers == 0
            || self.recognition.workers == 0
            || self.aggregation_workers == 0
        {
            return Err(anyhow!("worker counts must be greater than zero"));
        }
        if self.pop_timeout < Duration::from_millis(10) || self.pop_timeout > Duration::from_secs(10)
        {
            return Err(anyhow!("pop timeout must be between 10ms and 10s"));
        }
        if self.join_timeout > MAX_JOIN_TIMEOUT {
            return Err(anyhow!(
                "join timeout must not exceed {}s",
                MAX_JOIN_TIMEOUT.as_secs()
            ));
        }
        Ok(())
    }
}

fn check_unit(what: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("{} must be within [0, 1], got {}", what, value))
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
