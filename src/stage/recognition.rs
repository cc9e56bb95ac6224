use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use super::StageProcessor;
use crate::error::PipelineError;
use crate::frame::RawFrame;
use crate::recognize::{best_match, FeatureExtractor, IdentityStore};
use crate::record::{FaceRecord, RecognitionResult};

/// Face crops in, recognition results (plain JSON) out.
///
/// Every decodable face produces exactly one result; a face below the
/// similarity threshold is reported as `unknown`, never dropped.
pub struct RecognitionProcessor {
    extractor: Mutex<Box<dyn FeatureExtractor>>,
    identities: Arc<dyn IdentityStore>,
    threshold: f64,
}

impl RecognitionProcessor {
    pub fn new(
        extractor: Box<dyn FeatureExtractor>,
        identities: Arc<dyn IdentityStore>,
        threshold: f64,
    ) -> Self {
        Self {
            extractor: Mutex::new(extractor),
            identities,
            threshold,
        }
    }
}

impl StageProcessor for RecognitionProcessor {
    fn stage(&self) -> &'static str {
        "recognition"
    }

    fn process(&self, item: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError> {
        let face = FaceRecord::decode(item)?;
        let crop = RawFrame::decode_jpeg(&face.image)
            .map_err(|e| PipelineError::malformed(format!("face image: {:#}", e)))?;

        let features = {
            let mut extractor = self.extractor.lock().map_err(|_| {
                PipelineError::capability("feature extraction", anyhow!("extractor lock poisoned"))
            })?;
            extractor
                .extract(&crop)
                .map_err(|e| PipelineError::capability("feature extraction", e))?
        };
        let known = self
            .identities
            .list_known()
            .map_err(|e| PipelineError::capability("identity lookup", e))?;
        let matched = best_match(&features, &known, self.threshold);

        let result = RecognitionResult {
            source_id: face.source_id,
            timestamp: face.timestamp,
            bbox: face.bbox,
            identity: matched.identity,
            confidence: matched.confidence,
            processed_at: crate::now_s(),
        };
        log::debug!(
            "{}: {:?} -> {} ({:.3})",
            result.source_id,
            result.bbox,
            result.identity,
            result.confidence
        );
        Ok(vec![result.to_json()?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::InMemoryIdentityStore;
    use crate::record::{BBox, UNKNOWN_IDENTITY};
    use std::collections::HashMap;

    struct Fixed(Vec<f32>);

    impl FeatureExtractor for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn extract(&mut self, _: &RawFrame) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn face_bytes() -> Vec<u8> {
        let crop = RawFrame::new(vec![128; 120 * 120 * 3], 120, 120).unwrap();
        FaceRecord {
            source_id: "stream_2".to_string(),
            timestamp: 42.5,
            debug: false,
            bbox: BBox::new(10, 10, 130, 130),
            image: crop.encode_jpeg(90).unwrap(),
        }
        .encode()
        .unwrap()
    }

    fn identities(entries: &[(&str, Vec<f32>)]) -> Arc<dyn IdentityStore> {
        let map: HashMap<String, Vec<f32>> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Arc::new(InMemoryIdentityStore::with_identities(map))
    }

    #[test]
    fn known_face_is_named() {
        let processor = RecognitionProcessor::new(
            Box::new(Fixed(vec![1.0, 0.0])),
            identities(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]),
            0.7,
        );
        let out = processor.process(&face_bytes()).unwrap();
        assert_eq!(out.len(), 1);
        let result = RecognitionResult::from_json(&out[0]).unwrap();
        assert_eq!(result.identity, "alice");
        assert_eq!(result.source_id, "stream_2");
        assert_eq!(result.bbox, BBox::new(10, 10, 130, 130));
        assert!(result.processed_at > 0.0);
    }

    #[test]
    fn weak_match_is_kept_as_unknown() {
        let processor = RecognitionProcessor::new(
            Box::new(Fixed(vec![0.55, (1.0f32 - 0.55 * 0.55).sqrt()])),
            identities(&[("alice", vec![1.0, 0.0])]),
            0.7,
        );
        let out = processor.process(&face_bytes()).unwrap();
        let result = RecognitionResult::from_json(&out[0]).unwrap();
        assert_eq!(result.identity, UNKNOWN_IDENTITY);
        assert!((result.confidence - 0.55).abs() < 1e-5);
    }

    #[test]
    fn identity_store_failure_is_a_capability_error() {
        struct Offline;
        impl IdentityStore for Offline {
            fn list_known(&self) -> anyhow::Result<HashMap<String, Vec<f32>>> {
                Err(anyhow!("database unavailable"))
            }
        }
        let processor =
            RecognitionProcessor::new(Box::new(Fixed(vec![1.0])), Arc::new(Offline), 0.7);
        assert!(matches!(
            processor.process(&face_bytes()),
            Err(PipelineError::Capability { capability: "identity lookup", .. })
        ));
    }
}
