//! facestream: multi-source video face pipeline.
//!
//! Frames are read from RTSP streams, local or remote video files and
//! synthetic sources, sampled down to a target rate and pushed through three
//! queue-connected stages:
//!
//! - `detection`: decode the frame, find faces, crop and encode them.
//! - `recognition`: extract features and match against known identities.
//! - `aggregation`: keep the newest results in a bounded, expiring store and
//!   hand them to an optional persistent sink.
//!
//! # Module Structure
//!
//! - `codec`, `record`, `frame`: wire formats and image handling
//! - `broker`, `governor`, `store`: queues and their limits
//! - `ingest`, `registry`: source readers and their lifecycle
//! - `detect`, `recognize`, `stage`: per-stage capabilities and workers
//! - `pipeline`: supervisor and operator control surface

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod broker;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod governor;
pub mod ingest;
pub mod pipeline;
pub mod recognize;
pub mod record;
pub mod registry;
pub mod shutdown;
pub mod sink;
pub mod stage;
pub mod store;

pub use broker::{Broker, Queue, QueueSpec};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use frame::RawFrame;
pub use pipeline::{Capabilities, Pipeline, SourceOptions, StageState};
pub use record::{BBox, FaceRecord, FrameRecord, RecognitionResult, StoredResult};
pub use registry::{SourceInfo, SourceRegistry, SourceStatus};
pub use shutdown::StopSignal;
pub use store::ResultStore;

/// Wall-clock seconds since the Unix epoch, with sub-second precision.
pub fn now_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:facestream_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
