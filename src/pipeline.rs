//! Pipeline supervisor and operator control surface.
//!
//! `Pipeline::start` builds the broker and result store, starts the three
//! stage pools and the governor, and then accepts sources. A stage whose
//! capability failed to initialise stays down with an error status while the
//! rest of the pipeline runs.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::broker::Broker;
use crate::config::PipelineConfig;
use crate::detect::DetectorBackend;
use crate::error::PipelineError;
use crate::governor::Governor;
use crate::ingest::{
    CaptureOpener, ReaderExit, ReaderSettings, ReconnectPolicy, SourceReader, SourceTarget,
};
use crate::recognize::{FeatureExtractor, IdentityStore};
use crate::record::StoredResult;
use crate::registry::{SourceInfo, SourceRegistry, SourceStatus};
use crate::shutdown::StopSignal;
use crate::sink::ResultSink;
use crate::stage::{
    AggregationProcessor, DetectionProcessor, DetectionSettings, RecognitionProcessor,
    StageCounters, StageProcessor, StageStats, WorkerPool,
};
use crate::store::ResultStore;

/// External capabilities handed to the pipeline. Initialisation failures are
/// carried in as errors so the affected stage can report them.
pub struct Capabilities {
    pub capture: Arc<dyn CaptureOpener>,
    pub detector: anyhow::Result<Box<dyn DetectorBackend>>,
    pub extractor: anyhow::Result<Box<dyn FeatureExtractor>>,
    pub identities: anyhow::Result<Arc<dyn IdentityStore>>,
    pub sink: Option<Box<dyn ResultSink>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// Use the relaxed debug face width for this source.
    pub debug_mode: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum StageState {
    Running,
    Error(String),
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    pub state: StageState,
    pub counters: StageCounters,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueLengths {
    pub frames: usize,
    pub faces: usize,
    pub recognition: usize,
    pub results: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub detached: usize,
}

struct StageSlot {
    stage: &'static str,
    state: StageState,
    stats: Arc<StageStats>,
}

struct SourceHandle {
    stop: StopSignal,
    thread: Option<JoinHandle<ReaderExit>>,
}

pub struct Pipeline {
    config: PipelineConfig,
    broker: Broker,
    store: Arc<ResultStore>,
    registry: Arc<SourceRegistry>,
    capture: Arc<dyn CaptureOpener>,
    stop: StopSignal,
    stages: Mutex<Vec<StageSlot>>,
    sources: Mutex<HashMap<String, SourceHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pipeline {
    pub fn start(config: PipelineConfig, caps: Capabilities) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::Startup(format!("{:#}", e)))?;

        let broker = Broker::new(
            &config.queues.frames,
            &config.queues.faces,
            &config.queues.recognition,
        );
        let store = Arc::new(ResultStore::new(
            config.store.max_results,
            config.store.result_ttl,
        ));
        let stop = StopSignal::new();
        let mut stages = Vec::new();
        let mut threads = Vec::new();

        let detection: anyhow::Result<Arc<dyn StageProcessor>> = caps.detector.map(|mut detector| {
            if let Err(e) = detector.warm_up() {
                log::warn!("detector '{}' warm-up failed: {:#}", detector.name(), e);
            }
            log::info!("detection stage using '{}' backend", detector.name());
            let settings = DetectionSettings {
                min_face_width: config.detection.min_face_width,
                debug_min_face_width: config.detection.debug_min_face_width,
                force_debug: config.detection.debug_mode,
                jpeg_quality: config.ingest.jpeg_quality,
            };
            Arc::new(DetectionProcessor::new(detector, settings)) as Arc<dyn StageProcessor>
        });
        stages.push(launch_stage(
            "detection",
            detection,
            config.detection.workers,
            &broker,
            &config,
            &stop,
            &mut threads,
        ));

        let recognition: anyhow::Result<Arc<dyn StageProcessor>> =
            caps.extractor.and_then(|extractor| {
                let identities = caps.identities?;
                log::info!("recognition stage using '{}' extractor", extractor.name());
                Ok(Arc::new(RecognitionProcessor::new(
                    extractor,
                    identities,
                    config.recognition.similarity_threshold,
                )) as Arc<dyn StageProcessor>)
            });
        stages.push(launch_stage(
            "recognition",
            recognition,
            config.recognition.workers,
            &broker,
            &config,
            &stop,
            &mut threads,
        ));

        if let Some(sink) = &caps.sink {
            log::info!("aggregation stage persisting to '{}' sink", sink.name());
        }
        let aggregation: anyhow::Result<Arc<dyn StageProcessor>> =
            Ok(Arc::new(AggregationProcessor::new(store.clone(), caps.sink)));
        stages.push(launch_stage(
            "aggregation",
            aggregation,
            config.aggregation_workers,
            &broker,
            &config,
            &stop,
            &mut threads,
        ));

        let governor = Governor::new(
            broker.clone(),
            store.clone(),
            config.store.trim_interval,
            config.store.flush_interval,
        );
        match governor.spawn(stop.clone()) {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                stop.trigger();
                return Err(PipelineError::Startup(format!("spawn governor: {}", e)));
            }
        }

        Ok(Self {
            config,
            broker,
            store,
            registry: Arc::new(SourceRegistry::new()),
            capture: caps.capture,
            stop,
            stages: Mutex::new(stages),
            sources: Mutex::new(HashMap::new()),
            threads: Mutex::new(threads),
        })
    }

    /// Validate `url`, register it and start its reader. Returns the source id.
    pub fn start_source(&self, url: &str, options: SourceOptions) -> Result<String, PipelineError> {
        let target = SourceTarget::parse(url)?;
        // held until the handle is in place so shutdown sees every reader
        let mut sources = lock(&self.sources);
        if self.stop.is_triggered() {
            return Err(PipelineError::Startup("pipeline is shutting down".to_string()));
        }
        let source_id = self.registry.register(url, options.debug_mode);
        let source_stop = StopSignal::new();

        let reader = SourceReader::new(
            source_id.clone(),
            target,
            options.debug_mode,
            self.capture.clone(),
            self.broker.frames.clone(),
            self.reader_settings(),
            source_stop.clone(),
        );
        let registry = self.registry.clone();
        let spawned = thread::Builder::new()
            .name(format!("reader-{}", source_id))
            .spawn(move || run_reader(reader, &registry));

        match spawned {
            Ok(handle) => {
                sources.insert(
                    source_id.clone(),
                    SourceHandle {
                        stop: source_stop,
                        thread: Some(handle),
                    },
                );
                log::info!("started source {} ({})", source_id, url);
                Ok(source_id)
            }
            Err(e) => {
                let reason = format!("spawn reader: {}", e);
                let _ = self.registry.set_error(&source_id, reason.clone());
                Err(PipelineError::Startup(reason))
            }
        }
    }

    /// Ask a source to stop. Returns its status after the request.
    pub fn stop_source(&self, source_id: &str) -> Result<SourceStatus, PipelineError> {
        self.registry.begin_stop(source_id)?;
        let mut sources = lock(&self.sources);
        if let Some(handle) = sources.get_mut(source_id) {
            handle.stop.trigger();
            if handle.thread.as_ref().is_some_and(|t| t.is_finished()) {
                if let Some(thread) = handle.thread.take() {
                    self.join_reader(source_id, thread);
                }
            }
        }
        drop(sources);
        self.source_status(source_id)
    }

    pub fn source_status(&self, source_id: &str) -> Result<SourceStatus, PipelineError> {
        self.registry
            .status(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))
    }

    pub fn source_info(&self, source_id: &str) -> Result<SourceInfo, PipelineError> {
        self.registry
            .get(source_id)
            .ok_or_else(|| PipelineError::UnknownSource(source_id.to_string()))
    }

    pub fn list_active_sources(&self) -> Vec<SourceInfo> {
        self.registry.list_active()
    }

    pub fn list_sources(&self) -> Vec<SourceInfo> {
        self.registry.list()
    }

    /// Newest stored results for a source, newest first.
    pub fn recent_results(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredResult>, PipelineError> {
        if self.registry.status(source_id).is_none() {
            return Err(PipelineError::UnknownSource(source_id.to_string()));
        }
        Ok(self.store.recent_for_source(source_id, limit))
    }

    pub fn stage_statuses(&self) -> Vec<StageReport> {
        lock(&self.stages)
            .iter()
            .map(|slot| StageReport {
                stage: slot.stage,
                state: slot.state.clone(),
                counters: slot.stats.snapshot(),
            })
            .collect()
    }

    pub fn queue_lengths(&self) -> QueueLengths {
        QueueLengths {
            frames: self.broker.frames.len(),
            faces: self.broker.faces.len(),
            recognition: self.broker.recognition.len(),
            results: self.store.len(),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Signal everything to stop and join threads until the join deadline.
    /// Threads still running at the deadline are logged and detached.
    pub fn shutdown(&self) -> ShutdownReport {
        log::info!("pipeline shutting down");
        let mut pending: Vec<(String, JoinHandle<()>)> = Vec::new();
        let mut readers: Vec<(String, JoinHandle<ReaderExit>)> = Vec::new();
        {
            let mut sources = lock(&self.sources);
            self.stop.trigger();
            for (id, handle) in sources.iter_mut() {
                let _ = self.registry.begin_stop(id);
                handle.stop.trigger();
                if let Some(thread) = handle.thread.take() {
                    readers.push((id.clone(), thread));
                }
            }
        }
        for thread in lock(&self.threads).drain(..) {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            pending.push((name, thread));
        }
        for slot in lock(&self.stages).iter_mut() {
            if slot.state == StageState::Running {
                slot.state = StageState::Stopped;
            }
        }

        let deadline = Instant::now().checked_add(self.config.join_timeout);
        let mut report = ShutdownReport::default();
        for (name, thread) in readers {
            if wait_until_finished(&thread, deadline) {
                self.join_reader(&name, thread);
                report.joined += 1;
            } else {
                log::warn!("reader {} did not stop in time; detaching", name);
                report.detached += 1;
            }
        }
        for (name, thread) in pending {
            if wait_until_finished(&thread, deadline) {
                if thread.join().is_err() {
                    log::warn!("thread {} panicked", name);
                }
                report.joined += 1;
            } else {
                log::warn!("thread {} did not stop in time; detaching", name);
                report.detached += 1;
            }
        }
        log::info!(
            "pipeline stopped: {} thread(s) joined, {} detached",
            report.joined,
            report.detached
        );
        report
    }

    fn join_reader(&self, source_id: &str, thread: JoinHandle<ReaderExit>) {
        if thread.join().is_err() {
            log::warn!("reader {} panicked", source_id);
            let _ = self.registry.set_error(source_id, "reader panicked".to_string());
        }
    }

    fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            target_sample_rate: self.config.ingest.target_sample_rate,
            default_fps: self.config.ingest.default_fps,
            reconnect: ReconnectPolicy {
                step: self.config.ingest.reconnect_step,
                cap: self.config.ingest.reconnect_cap,
            },
            jpeg_quality: self.config.ingest.jpeg_quality,
            ..ReaderSettings::default()
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop.trigger();
        for handle in lock(&self.sources).values() {
            handle.stop.trigger();
        }
    }
}

fn launch_stage(
    stage: &'static str,
    processor: anyhow::Result<Arc<dyn StageProcessor>>,
    workers: usize,
    broker: &Broker,
    config: &PipelineConfig,
    stop: &StopSignal,
    threads: &mut Vec<JoinHandle<()>>,
) -> StageSlot {
    let (input, output) = match stage {
        "detection" => (broker.frames.clone(), Some(broker.faces.clone())),
        "recognition" => (broker.faces.clone(), Some(broker.recognition.clone())),
        _ => (broker.recognition.clone(), None),
    };
    let failed = |reason: String| {
        log::error!("{} stage not started: {}", stage, reason);
        StageSlot {
            stage,
            state: StageState::Error(reason),
            stats: Arc::new(StageStats::default()),
        }
    };

    let processor = match processor {
        Ok(processor) => processor,
        Err(e) => return failed(format!("{:#}", e)),
    };
    match WorkerPool::spawn(
        processor,
        workers,
        input,
        output,
        config.pop_timeout,
        stop.clone(),
    ) {
        Ok(pool) => {
            let stats = pool.stats_handle();
            threads.extend(pool.into_handles());
            StageSlot {
                stage,
                state: StageState::Running,
                stats,
            }
        }
        Err(e) => failed(e.to_string()),
    }
}

/// Run a reader, turning a panic into an error status for its source.
fn run_reader(reader: SourceReader, registry: &SourceRegistry) -> ReaderExit {
    let source_id = reader.source_id().to_string();
    match catch_unwind(AssertUnwindSafe(|| reader.run(registry))) {
        Ok(exit) => exit,
        Err(_) => {
            log::error!("{}: reader panicked", source_id);
            let reason = "reader panicked".to_string();
            if let Err(e) = registry.set_error(&source_id, reason.clone()) {
                log::warn!("{}: {}", source_id, e);
            }
            ReaderExit::Failed(reason)
        }
    }
}

/// `None` waits for as long as the thread runs.
fn wait_until_finished<T>(thread: &JoinHandle<T>, deadline: Option<Instant>) -> bool {
    while !thread.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::ingest::DefaultCaptureOpener;
    use crate::recognize::{HistogramExtractor, InMemoryIdentityStore};

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.pop_timeout = Duration::from_millis(20);
        config.ingest.reconnect_step = Duration::from_millis(10);
        config.ingest.reconnect_cap = Duration::from_millis(50);
        config
    }

    fn capabilities() -> Capabilities {
        Capabilities {
            capture: Arc::new(DefaultCaptureOpener::new(Duration::from_secs(1))),
            detector: Ok(Box::new(StubBackend::default())),
            extractor: Ok(Box::new(HistogramExtractor::new())),
            identities: Ok(Arc::new(InMemoryIdentityStore::new())),
            sink: None,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn invalid_source_is_rejected_before_registration() {
        let pipeline = Pipeline::start(test_config(), capabilities()).unwrap();
        let err = pipeline
            .start_source("ftp://camera/feed", SourceOptions::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSource(_)));
        assert!(pipeline.list_sources().is_empty());
        pipeline.shutdown();
    }

    #[test]
    fn unknown_source_ids_are_reported() {
        let pipeline = Pipeline::start(test_config(), capabilities()).unwrap();
        assert!(matches!(
            pipeline.stop_source("stream_9"),
            Err(PipelineError::UnknownSource(_))
        ));
        assert!(matches!(
            pipeline.source_status("stream_9"),
            Err(PipelineError::UnknownSource(_))
        ));
        assert!(matches!(
            pipeline.recent_results("stream_9", 5),
            Err(PipelineError::UnknownSource(_))
        ));
        pipeline.shutdown();
    }

    #[test]
    fn failed_capability_only_takes_down_its_stage() {
        let mut caps = capabilities();
        caps.extractor = Err(anyhow::anyhow!("model file missing"));
        let pipeline = Pipeline::start(test_config(), caps).unwrap();

        let statuses = pipeline.stage_statuses();
        assert_eq!(statuses[0].stage, "detection");
        assert_eq!(statuses[0].state, StageState::Running);
        assert_eq!(statuses[1].stage, "recognition");
        assert!(matches!(&statuses[1].state, StageState::Error(reason) if reason.contains("model file missing")));
        assert_eq!(statuses[2].state, StageState::Running);

        // faces pile up with no recognition workers to drain them
        let id = pipeline
            .start_source("stub://cam?frames=12&live=false", SourceOptions::default())
            .unwrap();
        assert!(wait_for(|| pipeline.queue_lengths().faces == 2));
        assert_eq!(pipeline.queue_lengths().results, 0);
        assert!(wait_for(|| pipeline.source_status(&id).ok() == Some(SourceStatus::Stopped)));
        pipeline.shutdown();
    }

    #[test]
    fn stop_source_stops_a_live_reader() {
        let pipeline = Pipeline::start(test_config(), capabilities()).unwrap();
        let id = pipeline
            .start_source("stub://cam?fps=30", SourceOptions { debug_mode: true })
            .unwrap();
        assert_eq!(id, "stream_0");
        assert!(wait_for(|| pipeline.source_status(&id).ok() == Some(SourceStatus::Running)));
        assert_eq!(pipeline.list_active_sources().len(), 1);
        assert!(pipeline.source_info(&id).unwrap().debug_mode);

        let status = pipeline.stop_source(&id).unwrap();
        assert!(matches!(status, SourceStatus::Stopping | SourceStatus::Stopped));
        assert!(wait_for(|| pipeline.source_status(&id).ok() == Some(SourceStatus::Stopped)));
        assert!(pipeline.list_active_sources().is_empty());

        let report = pipeline.shutdown();
        assert_eq!(report.detached, 0);
    }

    #[test]
    fn shutdown_refuses_new_sources_and_is_idempotent() {
        let pipeline = Pipeline::start(test_config(), capabilities()).unwrap();
        let first = pipeline.shutdown();
        assert!(first.joined >= 4);
        assert!(pipeline.stage_statuses().iter().all(|s| s.state == StageState::Stopped));
        assert!(matches!(
            pipeline.start_source("stub://cam", SourceOptions::default()),
            Err(PipelineError::Startup(_))
        ));
        assert_eq!(pipeline.shutdown(), ShutdownReport::default());
    }

    #[test]
    fn invalid_config_fails_startup() {
        let mut config = test_config();
        config.store.max_results = 0;
        assert!(matches!(
            Pipeline::start(config, capabilities()),
            Err(PipelineError::Startup(_))
        ));
    }

    #[test]
    fn panicking_reader_reports_an_error() {
        struct PanickingOpener;
        impl CaptureOpener for PanickingOpener {
            fn open(
                &self,
                _target: &SourceTarget,
            ) -> Result<Box<dyn crate::ingest::CaptureBackend>, PipelineError> {
                panic!("capture backend bug");
            }
        }
        let mut caps = capabilities();
        caps.capture = Arc::new(PanickingOpener);
        let pipeline = Pipeline::start(test_config(), caps).unwrap();

        let id = pipeline
            .start_source("stub://cam", SourceOptions::default())
            .unwrap();
        assert!(wait_for(|| pipeline.source_status(&id).ok() == Some(SourceStatus::Error)));
        let info = pipeline.source_info(&id).unwrap();
        assert_eq!(info.error.as_deref(), Some("reader panicked"));

        let report = pipeline.shutdown();
        assert_eq!(report.detached, 0);
        assert_eq!(pipeline.source_status(&id).unwrap(), SourceStatus::Error);
    }

    #[test]
    fn sources_started_during_shutdown_are_stopped() {
        let pipeline = Pipeline::start(test_config(), capabilities()).unwrap();
        let report = thread::scope(|scope| {
            let starter = scope.spawn(|| {
                let mut started = 0;
                while pipeline
                    .start_source("stub://cam?realtime=true", SourceOptions::default())
                    .is_ok()
                {
                    started += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                started
            });
            assert!(wait_for(|| !pipeline.list_sources().is_empty()));
            let report = pipeline.shutdown();
            assert!(starter.join().unwrap() >= 1);
            report
        });

        assert_eq!(report.detached, 0);
        let sources = pipeline.list_sources();
        assert!(report.joined >= sources.len() + 4);
        for source in sources {
            assert_eq!(source.status, SourceStatus::Stopped, "{}", source.source_id);
        }
    }
}
