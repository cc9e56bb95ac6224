use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::open_db_connection;
use crate::record::{BBox, RecognitionResult, StoredResult};

/// Durable destination for aggregated results.
///
/// Failures are reported to the caller, which logs and moves on; a sink can
/// never stall the aggregation stage.
pub trait ResultSink: Send {
    fn name(&self) -> &'static str;

    fn persist(&mut self, result: &StoredResult) -> Result<()>;
}

/// Logs each result at debug level and stores nothing.
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn persist(&mut self, result: &StoredResult) -> Result<()> {
        log::debug!(
            "result {} identity={} confidence={:.3}",
            result.key,
            result.result.identity,
            result.result.confidence
        );
        Ok(())
    }
}

/// SQLite `results` table keyed by the store key.
pub struct SqliteResultSink {
    conn: Connection,
}

impl SqliteResultSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open results database {}", db_path))?;
        let sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS results (
              key TEXT PRIMARY KEY,
              source_id TEXT NOT NULL,
              timestamp REAL NOT NULL,
              bbox_json TEXT NOT NULL,
              identity TEXT NOT NULL,
              confidence REAL NOT NULL,
              processed_at REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_results_source_ts ON results(source_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    /// Most recent persisted results for a source, newest first.
    pub fn recent(&self, source_id: &str, limit: usize) -> Result<Vec<StoredResult>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            r#"
            SELECT key, source_id, timestamp, bbox_json, identity, confidence, processed_at
            FROM results
            WHERE source_id = ?1
            ORDER BY timestamp DESC, key ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![source_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, source_id, timestamp, bbox_json, identity, confidence, processed_at) = row?;
            let bbox: BBox = serde_json::from_str(&bbox_json)
                .with_context(|| format!("corrupt bbox for result {}", key))?;
            out.push(StoredResult {
                key,
                result: RecognitionResult {
                    source_id,
                    timestamp,
                    bbox,
                    identity,
                    confidence,
                    processed_at,
                },
            });
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM results", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

impl ResultSink for SqliteResultSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn persist(&mut self, stored: &StoredResult) -> Result<()> {
        let r = &stored.result;
        let bbox_json = serde_json::to_string(&r.bbox)?;
        self.conn.execute(
            r#"
            INSERT INTO results(key, source_id, timestamp, bbox_json, identity, confidence, processed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(key) DO UPDATE SET
              identity = excluded.identity,
              confidence = excluded.confidence,
              processed_at = excluded.processed_at
            "#,
            params![
                stored.key,
                r.source_id,
                r.timestamp,
                bbox_json,
                r.identity,
                r.confidence,
                r.processed_at
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;

    fn stored(source: &str, timestamp: f64, identity: &str) -> StoredResult {
        StoredResult::from(RecognitionResult {
            source_id: source.to_string(),
            timestamp,
            bbox: BBox::new(1, 2, 121, 122),
            identity: identity.to_string(),
            confidence: 0.8,
            processed_at: timestamp + 1.0,
        })
    }

    #[test]
    fn persists_and_reads_back_newest_first() -> Result<()> {
        let mut sink = SqliteResultSink::open(&shared_memory_uri())?;
        sink.persist(&stored("stream_0", 10.0, "alice"))?;
        sink.persist(&stored("stream_0", 20.0, "bob"))?;
        sink.persist(&stored("stream_1", 30.0, "carol"))?;

        let recent = sink.recent("stream_0", 10)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].result.identity, "bob");
        assert_eq!(recent[0].result.bbox, BBox::new(1, 2, 121, 122));
        assert_eq!(recent[1], stored("stream_0", 10.0, "alice"));
        Ok(())
    }

    #[test]
    fn persisting_same_key_updates_row() -> Result<()> {
        let mut sink = SqliteResultSink::open(&shared_memory_uri())?;
        sink.persist(&stored("stream_0", 10.0, "unknown"))?;
        sink.persist(&stored("stream_0", 10.0, "alice"))?;

        assert_eq!(sink.count()?, 1);
        assert_eq!(sink.recent("stream_0", 1)?[0].result.identity, "alice");
        Ok(())
    }

    #[test]
    fn log_sink_accepts_everything() {
        let mut sink = LogSink;
        assert!(sink.persist(&stored("stream_0", 1.0, "unknown")).is_ok());
        assert_eq!(sink.name(), "log");
    }
}
