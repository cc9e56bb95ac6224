//! Keyed result store with size cap and TTL expiry.
//!
//! The aggregation stage upserts into it; the governor caps and expires it.
//! Each operation takes the store lock once, so operations are atomic per key.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::record::{RecognitionResult, StoredResult};

#[derive(Debug)]
pub struct ResultStore {
    max_len: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, StoredResult>>,
}

impl ResultStore {
    pub fn new(max_len: usize, ttl: Duration) -> Self {
        Self {
            max_len,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredResult>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the result under its key. Returns the stored record.
    pub fn upsert(&self, result: RecognitionResult) -> StoredResult {
        let stored = StoredResult::from(result);
        self.lock().insert(stored.key.clone(), stored.clone());
        stored
    }

    pub fn get(&self, key: &str) -> Option<StoredResult> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Evict oldest-by-timestamp entries until at most `max_len` remain.
    /// Equal timestamps are evicted in key order. Returns the number evicted.
    pub fn cap_to_max(&self) -> usize {
        let mut entries = self.lock();
        let excess = entries.len().saturating_sub(self.max_len);
        if excess == 0 {
            return 0;
        }
        let mut order: Vec<(f64, String)> = entries
            .values()
            .map(|s| (s.result.timestamp, s.key.clone()))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        for (_, key) in order.into_iter().take(excess) {
            entries.remove(&key);
        }
        excess
    }

    /// Remove every entry whose timestamp is strictly older than `cutoff`.
    pub fn expire_before(&self, cutoff: f64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, s| s.result.timestamp >= cutoff);
        before - entries.len()
    }

    /// Full TTL sweep relative to `now` (unix seconds).
    pub fn expire(&self, now: f64) -> usize {
        self.expire_before(now - self.ttl.as_secs_f64())
    }

    /// Newest results for one source, newest first.
    pub fn recent_for_source(&self, source_id: &str, limit: usize) -> Vec<StoredResult> {
        let mut matches: Vec<StoredResult> = self
            .lock()
            .values()
            .filter(|s| s.result.source_id == source_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.result
                .timestamp
                .total_cmp(&a.result.timestamp)
                .then_with(|| a.key.cmp(&b.key))
        });
        matches.truncate(limit);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BBox, UNKNOWN_IDENTITY};

    fn result(source: &str, timestamp: f64, x1: i32) -> RecognitionResult {
        RecognitionResult {
            source_id: source.to_string(),
            timestamp,
            bbox: BBox::new(x1, 0, x1 + 120, 120),
            identity: UNKNOWN_IDENTITY.to_string(),
            confidence: 0.1,
            processed_at: timestamp + 0.5,
        }
    }

    #[test]
    fn upsert_replaces_same_key() {
        let store = ResultStore::new(10, Duration::from_secs(60));
        let first = store.upsert(result("stream_0", 100.0, 0));
        let mut updated = result("stream_0", 100.0, 0);
        updated.identity = "alice".to_string();
        store.upsert(updated);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first.key).unwrap().result.identity, "alice");
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let store = ResultStore::new(2, Duration::from_secs(60));
        store.upsert(result("stream_0", 30.0, 0));
        store.upsert(result("stream_0", 10.0, 0));
        store.upsert(result("stream_0", 20.0, 0));
        store.upsert(result("stream_1", 40.0, 0));

        assert_eq!(store.cap_to_max(), 2);
        let mut left: Vec<f64> = ["stream_0", "stream_1"]
            .iter()
            .flat_map(|s| store.recent_for_source(s, 10))
            .map(|s| s.result.timestamp)
            .collect();
        left.sort_by(f64::total_cmp);
        assert_eq!(left, vec![30.0, 40.0]);
    }

    #[test]
    fn cap_breaks_timestamp_ties_by_key() {
        let store = ResultStore::new(1, Duration::from_secs(60));
        let a = store.upsert(result("stream_0", 5.0, 0));
        let b = store.upsert(result("stream_0", 5.0, 200));
        assert!(a.key < b.key);

        store.cap_to_max();
        assert!(store.get(&a.key).is_none());
        assert!(store.get(&b.key).is_some());
    }

    #[test]
    fn expiry_removes_only_stale_entries() {
        let store = ResultStore::new(100, Duration::from_secs(3600));
        let now = 10_000.0;
        let stale = store.upsert(result("stream_0", now - 3601.0, 0));
        let edge = store.upsert(result("stream_0", now - 3600.0, 10));
        let fresh = store.upsert(result("stream_0", now - 5.0, 20));

        assert_eq!(store.expire(now), 1);
        assert!(store.get(&stale.key).is_none());
        assert!(store.get(&edge.key).is_some());
        assert!(store.get(&fresh.key).is_some());
    }

    #[test]
    fn recent_results_are_newest_first_and_limited() {
        let store = ResultStore::new(100, Duration::from_secs(60));
        for ts in [1.0, 4.0, 2.0, 3.0] {
            store.upsert(result("stream_0", ts, 0));
        }
        store.upsert(result("stream_9", 99.0, 0));

        let recent: Vec<f64> = store
            .recent_for_source("stream_0", 3)
            .into_iter()
            .map(|s| s.result.timestamp)
            .collect();
        assert_eq!(recent, vec![4.0, 3.0, 2.0]);
        assert!(store.recent_for_source("stream_5", 3).is_empty());
    }
}
