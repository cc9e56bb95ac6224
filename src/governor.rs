//! Background enforcement of queue and store limits.
//!
//! Two cadences: every `trim_interval` each queue is trimmed to its maximum
//! and the result store is capped; every `flush_interval` the store is swept
//! of results older than its TTL.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::broker::Broker;
use crate::shutdown::StopSignal;
use crate::store::ResultStore;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub queue_items_dropped: usize,
    pub results_evicted: usize,
}

pub struct Governor {
    broker: Broker,
    store: Arc<ResultStore>,
    trim_interval: Duration,
    flush_interval: Duration,
}

impl Governor {
    pub fn new(
        broker: Broker,
        store: Arc<ResultStore>,
        trim_interval: Duration,
        flush_interval: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            trim_interval,
            flush_interval,
        }
    }

    /// Trim every queue to its maximum and cap the store.
    pub fn trim_cycle(&self) -> TrimReport {
        let mut report = TrimReport::default();
        for queue in self.broker.queues() {
            let dropped = queue.trim();
            if dropped > 0 {
                log::warn!(
                    "queue '{}' over limit: dropped {} oldest item(s), {} left",
                    queue.name(),
                    dropped,
                    queue.len()
                );
            }
            report.queue_items_dropped += dropped;
        }
        report.results_evicted = self.store.cap_to_max();
        if report.results_evicted > 0 {
            log::info!(
                "result store capped to {}: evicted {}",
                self.store.max_len(),
                report.results_evicted
            );
        }
        report
    }

    /// Delete every stored result older than `now - ttl`.
    pub fn expiry_sweep(&self, now: f64) -> usize {
        let expired = self.store.expire(now);
        log::info!(
            "expiry sweep removed {} result(s), {} remain",
            expired,
            self.store.len()
        );
        expired
    }

    /// Run both cadences on a named thread until `stop` fires.
    pub fn spawn(self, stop: StopSignal) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("governor".to_string())
            .spawn(move || self.run(stop))
    }

    fn run(self, stop: StopSignal) {
        // a cadence whose next tick is past the end of the clock never fires
        let start = Instant::now();
        let mut next_trim = start.checked_add(self.trim_interval);
        let mut next_sweep = start.checked_add(self.flush_interval);
        loop {
            let wait = match next_trim.into_iter().chain(next_sweep).min() {
                Some(wake) => wake.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if stop.wait_timeout(wait) {
                break;
            }
            let now = Instant::now();
            if next_trim.is_some_and(|due| now >= due) {
                self.trim_cycle();
                next_trim = now.checked_add(self.trim_interval);
            }
            if next_sweep.is_some_and(|due| now >= due) {
                self.expiry_sweep(crate::now_s());
                next_sweep = now.checked_add(self.flush_interval);
            }
        }
        log::debug!("governor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueSpec;
    use crate::record::{BBox, RecognitionResult, UNKNOWN_IDENTITY};

    fn broker() -> Broker {
        Broker::new(
            &QueueSpec::new("frames", 2),
            &QueueSpec::new("faces", 3),
            &QueueSpec::new("recognition", 4),
        )
    }

    fn result(timestamp: f64) -> RecognitionResult {
        RecognitionResult {
            source_id: "stream_0".to_string(),
            timestamp,
            bbox: BBox::new(0, 0, 100, 100),
            identity: UNKNOWN_IDENTITY.to_string(),
            confidence: 0.2,
            processed_at: timestamp,
        }
    }

    #[test]
    fn trim_cycle_bounds_every_queue_and_the_store() {
        let broker = broker();
        for i in 0..10u8 {
            broker.frames.push(vec![i]);
            broker.faces.push(vec![i]);
            broker.recognition.push(vec![i]);
        }
        let store = Arc::new(ResultStore::new(2, Duration::from_secs(60)));
        for ts in [1.0, 2.0, 3.0] {
            store.upsert(result(ts));
        }

        let governor = Governor::new(
            broker.clone(),
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        let report = governor.trim_cycle();

        assert_eq!(report.queue_items_dropped, 8 + 7 + 6);
        assert_eq!(report.results_evicted, 1);
        for q in broker.queues() {
            assert_eq!(q.len(), q.max_len());
        }
        // newest survive, in order
        assert_eq!(broker.frames.blocking_pop(Duration::ZERO), Some(vec![8]));
        assert_eq!(broker.frames.blocking_pop(Duration::ZERO), Some(vec![9]));
    }

    #[test]
    fn sweep_uses_store_ttl() {
        let store = Arc::new(ResultStore::new(100, Duration::from_secs(100)));
        store.upsert(result(850.0));
        store.upsert(result(950.0));
        let governor = Governor::new(
            broker(),
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(governor.expiry_sweep(1000.0), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn background_loop_trims_and_stops() {
        let broker = broker();
        for i in 0..10u8 {
            broker.frames.push(vec![i]);
        }
        let store = Arc::new(ResultStore::new(10, Duration::from_secs(60)));
        let stop = StopSignal::new();
        let handle = Governor::new(
            broker.clone(),
            store,
            Duration::from_millis(10),
            Duration::from_millis(15),
        )
        .spawn(stop.clone())
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.frames.len() > 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broker.frames.len(), 2);

        stop.trigger();
        handle.join().unwrap();
    }

    #[test]
    fn unreachable_sweep_does_not_stop_trimming() {
        let broker = broker();
        for i in 0..10u8 {
            broker.frames.push(vec![i]);
        }
        let store = Arc::new(ResultStore::new(10, Duration::from_secs(60)));
        let stop = StopSignal::new();
        let handle = Governor::new(
            broker.clone(),
            store,
            Duration::from_millis(10),
            Duration::from_secs(u64::MAX),
        )
        .spawn(stop.clone())
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.frames.len() > 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(broker.frames.len(), 2);
        assert!(!handle.is_finished());

        stop.trigger();
        assert!(handle.join().is_ok());
    }
}
