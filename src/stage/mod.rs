//! Stage worker pool.
//!
//! Each worker loops: pop from the input queue with a bounded timeout, run the
//! stage processor, push every output to the output queue. A failed or
//! panicking item is logged and dropped; the worker keeps going until the
//! stop signal fires.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::broker::Queue;
use crate::error::PipelineError;
use crate::shutdown::StopSignal;

mod aggregate;
mod detection;
mod recognition;

pub use aggregate::AggregationProcessor;
pub use detection::{DetectionProcessor, DetectionSettings};
pub use recognition::RecognitionProcessor;

/// Work done on one popped item.
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> &'static str;

    /// Turn one input payload into zero or more output payloads.
    fn process(&self, item: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError>;
}

/// Per-stage counters, shared by every worker of the stage.
#[derive(Debug, Default)]
pub struct StageStats {
    processed: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageCounters {
    pub processed: u64,
    pub emitted: u64,
    pub dropped: u64,
}

impl StageStats {
    pub fn snapshot(&self) -> StageCounters {
        StageCounters {
            processed: self.processed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    stage: &'static str,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<StageStats>,
}

impl WorkerPool {
    pub fn spawn(
        processor: Arc<dyn StageProcessor>,
        workers: usize,
        input: Arc<Queue>,
        output: Option<Arc<Queue>>,
        pop_timeout: Duration,
        stop: StopSignal,
    ) -> Result<Self, PipelineError> {
        let stage = processor.stage();
        let stats = Arc::new(StageStats::default());
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let worker = Worker {
                processor: processor.clone(),
                input: input.clone(),
                output: output.clone(),
                pop_timeout,
                stop: stop.clone(),
                stats: stats.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", stage, index))
                .spawn(move || worker.run())
                .map_err(|e| PipelineError::Startup(format!("spawn {} worker: {}", stage, e)))?;
            handles.push(handle);
        }
        log::info!(
            "{} stage started with {} worker(s) on queue '{}'",
            stage,
            workers,
            input.name()
        );
        Ok(Self {
            stage,
            handles,
            stats,
        })
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn stats(&self) -> StageCounters {
        self.stats.snapshot()
    }

    /// Shared counters; stay readable after the pool is consumed.
    pub fn stats_handle(&self) -> Arc<StageStats> {
        self.stats.clone()
    }

    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

struct Worker {
    processor: Arc<dyn StageProcessor>,
    input: Arc<Queue>,
    output: Option<Arc<Queue>>,
    pop_timeout: Duration,
    stop: StopSignal,
    stats: Arc<StageStats>,
}

impl Worker {
    fn run(self) {
        let stage = self.processor.stage();
        while !self.stop.is_triggered() {
            let Some(item) = self.input.blocking_pop(self.pop_timeout) else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| self.processor.process(&item))) {
                Ok(Ok(outputs)) => {
                    self.stats.processed.fetch_add(1, Ordering::Relaxed);
                    for out in outputs {
                        if let Some(queue) = &self.output {
                            queue.push(out);
                            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    match e {
                        PipelineError::Capability { .. } => {
                            log::error!("{}: dropping item: {}", stage, e)
                        }
                        _ => log::warn!("{}: dropping item: {}", stage, e),
                    }
                }
                Err(_) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::error!("{}: processor panicked; item dropped", stage);
                }
            }
        }
        log::debug!(
            "{} worker {:?} exiting",
            stage,
            thread::current().name().unwrap_or("?")
        );
    }
}
