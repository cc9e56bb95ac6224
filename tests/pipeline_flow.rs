use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use facestream::detect::StubBackend;
use facestream::frame::RawFrame;
use facestream::ingest::DefaultCaptureOpener;
use facestream::recognize::{FeatureExtractor, InMemoryIdentityStore};
use facestream::record::UNKNOWN_IDENTITY;
use facestream::sink::SqliteResultSink;
use facestream::{
    shared_memory_uri, BBox, Capabilities, Pipeline, PipelineConfig, SourceOptions, SourceStatus,
};

/// Returns the same vector for every crop.
struct FixedExtractor(Vec<f32>);

impl FeatureExtractor for FixedExtractor {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn extract(&mut self, _image: &RawFrame) -> Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.pop_timeout = Duration::from_millis(20);
    config.detection.workers = 2;
    config.recognition.workers = 2;
    config
}

/// Unit vector whose cosine similarity with `[1, 0]` is `similarity`.
fn at_similarity(similarity: f32) -> Vec<f32> {
    vec![similarity, (1.0 - similarity * similarity).sqrt()]
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

fn aggregated(pipeline: &Pipeline) -> u64 {
    pipeline
        .stage_statuses()
        .iter()
        .find(|s| s.stage == "aggregation")
        .map(|s| s.counters.processed)
        .unwrap_or(0)
}

#[test]
fn finite_stub_source_flows_through_every_stage() {
    let db = shared_memory_uri();
    let sink = SqliteResultSink::open(&db).expect("open sink");
    let reader = SqliteResultSink::open(&db).expect("open reader");

    let identities = InMemoryIdentityStore::with_identities(HashMap::from([(
        "bob".to_string(),
        at_similarity(0.55),
    )]));
    let caps = Capabilities {
        capture: Arc::new(DefaultCaptureOpener::new(Duration::from_secs(1))),
        detector: Ok(Box::new(StubBackend::centered(120, 0.9))),
        extractor: Ok(Box::new(FixedExtractor(vec![1.0, 0.0]))),
        identities: Ok(Arc::new(identities)),
        sink: Some(Box::new(sink)),
    };
    let pipeline = Pipeline::start(config(), caps).expect("start pipeline");

    // 180 frames at 30 fps sampled to 5 per second: one frame in six
    let id = pipeline
        .start_source(
            "stub://lobby?fps=30&frames=180&live=false",
            SourceOptions::default(),
        )
        .expect("start source");

    wait_for("source to finish", || {
        pipeline.source_status(&id).ok() == Some(SourceStatus::Stopped)
    });
    wait_for("30 aggregated results", || aggregated(&pipeline) == 30);

    let stages = pipeline.stage_statuses();
    assert_eq!(stages[0].counters.processed, 30);
    assert_eq!(stages[0].counters.emitted, 30);
    assert_eq!(stages[1].counters.processed, 30);
    assert_eq!(stages[1].counters.emitted, 30);
    assert_eq!(stages.iter().map(|s| s.counters.dropped).sum::<u64>(), 0);

    let results = pipeline.recent_results(&id, 100).expect("results");
    assert_eq!(results.len(), 30);
    for stored in &results {
        assert_eq!(stored.result.source_id, id);
        assert_eq!(stored.result.identity, UNKNOWN_IDENTITY);
        assert!((stored.result.confidence - 0.55).abs() < 1e-5);
        // 120px square centred in the default 320x240 synthetic frame
        assert_eq!(stored.result.bbox, BBox::new(100, 60, 220, 180));
        assert_eq!(stored.key, stored.result.store_key());
    }
    assert!(results
        .windows(2)
        .all(|pair| pair[0].result.timestamp >= pair[1].result.timestamp));

    assert_eq!(reader.count().expect("count"), 30);
    assert_eq!(reader.recent(&id, 5).expect("recent").len(), 5);

    let lengths = pipeline.queue_lengths();
    assert_eq!((lengths.frames, lengths.faces, lengths.recognition), (0, 0, 0));
    assert_eq!(lengths.results, 30);
    assert!(pipeline.list_active_sources().is_empty());

    let report = pipeline.shutdown();
    assert_eq!(report.detached, 0);
}

#[test]
fn debug_sources_use_the_relaxed_face_width() {
    let bob = at_similarity(0.9);
    let identities =
        InMemoryIdentityStore::with_identities(HashMap::from([("bob".to_string(), bob.clone())]));
    let caps = Capabilities {
        capture: Arc::new(DefaultCaptureOpener::new(Duration::from_secs(1))),
        // 60px faces: below the normal minimum, above the debug one
        detector: Ok(Box::new(StubBackend::centered(60, 0.9))),
        extractor: Ok(Box::new(FixedExtractor(bob))),
        identities: Ok(Arc::new(identities)),
        sink: None,
    };
    let pipeline = Pipeline::start(config(), caps).expect("start pipeline");

    let url = "stub://door?fps=30&frames=60&width=160&height=120&live=false";
    let normal = pipeline
        .start_source(url, SourceOptions::default())
        .expect("start normal source");
    let debug = pipeline
        .start_source(url, SourceOptions { debug_mode: true })
        .expect("start debug source");
    assert_ne!(normal, debug);

    for id in [&normal, &debug] {
        wait_for("source to finish", || {
            pipeline.source_status(id).ok() == Some(SourceStatus::Stopped)
        });
    }
    wait_for("10 aggregated results", || aggregated(&pipeline) == 10);

    let detection = &pipeline.stage_statuses()[0];
    assert_eq!(detection.counters.processed, 20);
    assert_eq!(detection.counters.emitted, 10);

    assert!(pipeline.recent_results(&normal, 100).unwrap().is_empty());
    let matched = pipeline.recent_results(&debug, 100).unwrap();
    assert_eq!(matched.len(), 10);
    for stored in matched {
        assert_eq!(stored.result.identity, "bob");
        assert!(stored.result.confidence > 0.99);
    }

    pipeline.shutdown();
}

#[test]
fn rejected_and_failed_sources_report_errors() {
    let caps = Capabilities {
        capture: Arc::new(DefaultCaptureOpener::new(Duration::from_secs(1))),
        detector: Ok(Box::new(StubBackend::default())),
        extractor: Ok(Box::new(FixedExtractor(vec![1.0, 0.0]))),
        identities: Ok(Arc::new(InMemoryIdentityStore::new())),
        sink: None,
    };
    let pipeline = Pipeline::start(config(), caps).expect("start pipeline");

    for url in ["", "ftp://cam/1", "http://example.com/index.html", "/no/such/video.mp4"] {
        assert!(
            pipeline.start_source(url, SourceOptions::default()).is_err(),
            "{url}"
        );
    }
    assert!(pipeline.list_sources().is_empty());

    if cfg!(not(feature = "capture-ffmpeg")) {
        // accepted but unopenable without FFmpeg: the source ends in error
        let id = pipeline
            .start_source("rtsp://camera-7/stream", SourceOptions::default())
            .expect("rtsp url is valid");
        wait_for("source to fail", || {
            pipeline.source_status(&id).ok() == Some(SourceStatus::Error)
        });
        let info = pipeline.source_info(&id).unwrap();
        assert!(info.error.unwrap().contains("capture-ffmpeg"));
    }

    pipeline.shutdown();
}
