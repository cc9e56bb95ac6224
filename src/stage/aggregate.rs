use std::sync::{Arc, Mutex};

use super::StageProcessor;
use crate::error::PipelineError;
use crate::record::RecognitionResult;
use crate::sink::ResultSink;
use crate::store::ResultStore;

/// Terminal stage: upsert each result into the store, then hand it to the
/// sink. Sink failures are logged and never fail the item.
pub struct AggregationProcessor {
    store: Arc<ResultStore>,
    sink: Option<Mutex<Box<dyn ResultSink>>>,
}

impl AggregationProcessor {
    pub fn new(store: Arc<ResultStore>, sink: Option<Box<dyn ResultSink>>) -> Self {
        Self {
            store,
            sink: sink.map(Mutex::new),
        }
    }
}

impl StageProcessor for AggregationProcessor {
    fn stage(&self) -> &'static str {
        "aggregation"
    }

    fn process(&self, item: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError> {
        let result = RecognitionResult::from_json(item)?;
        let stored = self.store.upsert(result);

        if let Some(sink) = &self.sink {
            let persisted = match sink.lock() {
                Ok(mut sink) => sink.persist(&stored).map_err(PipelineError::Sink),
                Err(_) => Err(PipelineError::Sink(anyhow::anyhow!("sink lock poisoned"))),
            };
            if let Err(e) = persisted {
                log::warn!("{}: {}", stored.key, e);
            }
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BBox, StoredResult};
    use std::time::Duration;

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn persist(&mut self, _: &StoredResult) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    fn result_json(timestamp: f64) -> Vec<u8> {
        RecognitionResult {
            source_id: "stream_0".to_string(),
            timestamp,
            bbox: BBox::new(0, 0, 100, 100),
            identity: "alice".to_string(),
            confidence: 0.9,
            processed_at: timestamp,
        }
        .to_json()
        .unwrap()
    }

    #[test]
    fn stores_result_even_when_sink_fails() {
        let store = Arc::new(ResultStore::new(10, Duration::from_secs(60)));
        let processor = AggregationProcessor::new(store.clone(), Some(Box::new(FailingSink)));

        assert!(processor.process(&result_json(1.0)).unwrap().is_empty());
        assert!(processor.process(&result_json(2.0)).is_ok());
        assert_eq!(store.len(), 2);
        assert!(store.get("stream_0:1.0:0_0_100_100").is_some());
    }

    #[test]
    fn rejects_non_json_payload() {
        let store = Arc::new(ResultStore::new(10, Duration::from_secs(60)));
        let processor = AggregationProcessor::new(store.clone(), None);
        assert!(matches!(
            processor.process(b"\x00\x00\x00\x02{}"),
            Err(PipelineError::MalformedFrame(_))
        ));
        assert!(store.is_empty());
    }
}
