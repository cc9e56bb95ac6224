//! facestreamd - multi-source face pipeline daemon
//!
//! Loads `PipelineConfig` (JSON file named by FACESTREAM_CONFIG plus
//! FACESTREAM_* overrides), starts the detection, recognition and aggregation
//! stages, starts every configured source and logs a status line until
//! Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use facestream::detect::select_detector;
use facestream::ingest::DefaultCaptureOpener;
use facestream::recognize::{select_extractor, IdentityStore, SqliteIdentityStore};
use facestream::sink::{ResultSink, SqliteResultSink};
use facestream::{Capabilities, Pipeline, PipelineConfig, SourceOptions, StageState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-source video face detection and recognition")]
struct Args {
    /// Extra source URL to start (repeatable). Added to configured sources.
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Start the --source URLs in debug mode (relaxed minimum face width).
    #[arg(long)]
    debug: bool,

    /// Seconds between status log lines.
    #[arg(long, env = "FACESTREAM_STATUS_INTERVAL_SECS", default_value_t = 30)]
    status_interval_secs: u64,

    /// Keep results in memory only; do not write them to the database.
    #[arg(long)]
    no_persist: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.status_interval_secs == 0 {
        return Err(anyhow!("--status-interval-secs must be greater than zero"));
    }

    let config = PipelineConfig::load()?;
    log::info!(
        "facestreamd {} starting; database {}",
        env!("CARGO_PKG_VERSION"),
        config.db_path
    );

    let sink: Option<Box<dyn ResultSink>> = if args.no_persist {
        None
    } else {
        match SqliteResultSink::open(&config.db_path) {
            Ok(sink) => Some(Box::new(sink)),
            Err(e) => {
                log::warn!("results will not be persisted: {:#}", e);
                None
            }
        }
    };
    let identities = SqliteIdentityStore::open(&config.db_path)
        .map(|store| Arc::new(store) as Arc<dyn IdentityStore>);

    let caps = Capabilities {
        capture: Arc::new(DefaultCaptureOpener::new(config.ingest.io_timeout)),
        detector: select_detector(&config.detection),
        extractor: select_extractor(&config.recognition),
        identities,
        sink,
    };
    let configured = config.sources.clone();
    let pipeline = Pipeline::start(config, caps)?;

    let requested = configured
        .iter()
        .map(|url| (url, false))
        .chain(args.sources.iter().map(|url| (url, args.debug)));
    for (url, debug_mode) in requested {
        match pipeline.start_source(url, SourceOptions { debug_mode }) {
            Ok(id) => log::info!("source {} -> {}", url, id),
            Err(e) => log::error!("cannot start source {}: {}", url, e),
        }
    }
    if pipeline.list_sources().is_empty() {
        log::warn!("no sources running; set FACESTREAM_SOURCES or pass --source");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("facestreamd running; Ctrl-C to stop");
    let interval = Duration::from_secs(args.status_interval_secs);
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => log_status(&pipeline),
        }
    }

    log::info!("shutdown signal received");
    let report = pipeline.shutdown();
    if report.detached > 0 {
        log::warn!("{} thread(s) still running at exit", report.detached);
    }
    Ok(())
}

fn log_status(pipeline: &Pipeline) {
    let queues = pipeline.queue_lengths();
    log::info!(
        "queues: frames={} faces={} recognition={} results={}",
        queues.frames,
        queues.faces,
        queues.recognition,
        queues.results
    );
    for stage in pipeline.stage_statuses() {
        match &stage.state {
            StageState::Error(reason) => log::error!("stage {}: error: {}", stage.stage, reason),
            _ => log::info!(
                "stage {}: processed={} emitted={} dropped={}",
                stage.stage,
                stage.counters.processed,
                stage.counters.emitted,
                stage.counters.dropped
            ),
        }
    }
    for source in pipeline.list_sources() {
        match &source.error {
            Some(error) => log::info!("source {}: {} ({})", source.source_id, source.status, error),
            None => log::info!("source {}: {}", source.source_id, source.status),
        }
    }
}
