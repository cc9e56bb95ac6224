//! Face recognition capability.
//!
//! A [`FeatureExtractor`] turns a face crop into a vector; an
//! [`IdentityStore`] lists the enrolled vectors; [`best_match`] compares them
//! by cosine similarity (dot product of L2-normalised vectors).

use std::collections::HashMap;

use anyhow::Result;

use crate::config::RecognitionConfig;
use crate::frame::RawFrame;
use crate::record::UNKNOWN_IDENTITY;

mod histogram;
mod identities;
#[cfg(feature = "backend-tract")]
mod tract;

pub use histogram::HistogramExtractor;
pub use identities::{InMemoryIdentityStore, SqliteIdentityStore};
#[cfg(feature = "backend-tract")]
pub use tract::TractEmbedder;

/// Face crop size fed to the ONNX embedder.
pub const EMBEDDER_INPUT_SIZE: u32 = 112;

/// Feature extraction capability.
pub trait FeatureExtractor: Send {
    fn name(&self) -> &'static str;

    /// Fixed-length feature vector for a face crop.
    fn extract(&mut self, image: &RawFrame) -> Result<Vec<f32>>;
}

/// Read side of the known-identity store.
pub trait IdentityStore: Send + Sync {
    /// Every known identity with its feature vector.
    fn list_known(&self) -> Result<HashMap<String, Vec<f32>>>;
}

/// Extractor named by the config: the ONNX embedder when a model is
/// configured, otherwise colour histograms.
///
/// Enrolment must use the same extractor as the running pipeline or stored
/// vectors will not match.
pub fn select_extractor(config: &RecognitionConfig) -> Result<Box<dyn FeatureExtractor>> {
    match &config.model_path {
        #[cfg(feature = "backend-tract")]
        Some(path) => Ok(Box::new(TractEmbedder::new(path, EMBEDDER_INPUT_SIZE)?)),
        #[cfg(not(feature = "backend-tract"))]
        Some(path) => Err(anyhow::anyhow!(
            "recognition model {} requires the backend-tract feature",
            path.display()
        )),
        None => Ok(Box::new(HistogramExtractor::new())),
    }
}

/// Outcome of a best-match lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    /// Matched identity or `"unknown"`.
    pub identity: String,
    /// Best similarity, clamped to `[0, 1]`.
    pub confidence: f64,
}

impl Match {
    pub fn is_known(&self) -> bool {
        self.identity != UNKNOWN_IDENTITY
    }
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity. Zero when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Pick the most similar known identity.
///
/// The best identity is reported only when its similarity reaches
/// `threshold`; otherwise the identity is `"unknown"` with the sub-threshold
/// similarity as confidence. Known vectors of a different length are skipped.
pub fn best_match(features: &[f32], known: &HashMap<String, Vec<f32>>, threshold: f64) -> Match {
    let mut best: Option<(&str, f32)> = None;
    for (identity, vector) in known {
        if vector.len() != features.len() {
            log::warn!(
                "skipping identity '{}': {} features, expected {}",
                identity,
                vector.len(),
                features.len()
            );
            continue;
        }
        let similarity = cosine_similarity(features, vector);
        // ties resolve to the smaller identity so results are stable
        let better = match best {
            None => true,
            Some((name, score)) => {
                similarity > score || (similarity == score && identity.as_str() < name)
            }
        };
        if better {
            best = Some((identity.as_str(), similarity));
        }
    }

    match best {
        Some((identity, similarity)) => {
            let confidence = f64::from(similarity).clamp(0.0, 1.0);
            Match {
                identity: if confidence >= threshold {
                    identity.to_string()
                } else {
                    UNKNOWN_IDENTITY.to_string()
                },
                confidence,
            }
        }
        None => Match {
            identity: UNKNOWN_IDENTITY.to_string(),
            confidence: 0.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(entries: &[(&str, Vec<f32>)]) -> HashMap<String, Vec<f32>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn matches_identity_above_threshold() {
        let ids = known(&[("alice", vec![1.0, 0.0]), ("bob", vec![0.0, 1.0])]);
        let m = best_match(&[0.9, 0.1], &ids, 0.7);
        assert_eq!(m.identity, "alice");
        assert!(m.is_known());
        assert!(m.confidence > 0.99);
    }

    #[test]
    fn sub_threshold_match_is_unknown_with_its_similarity() {
        let ids = known(&[("alice", vec![1.0, 0.0])]);
        // cos = 0.55
        let features = [0.55f32, (1.0f32 - 0.55 * 0.55).sqrt()];
        let m = best_match(&features, &ids, 0.7);
        assert_eq!(m.identity, UNKNOWN_IDENTITY);
        assert!((m.confidence - 0.55).abs() < 1e-5);
    }

    #[test]
    fn no_known_identities_is_unknown_zero() {
        let m = best_match(&[1.0, 0.0], &HashMap::new(), 0.7);
        assert_eq!(m.identity, UNKNOWN_IDENTITY);
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn negative_similarity_clamps_to_zero() {
        let ids = known(&[("alice", vec![1.0, 0.0])]);
        let m = best_match(&[-1.0, 0.0], &ids, 0.7);
        assert_eq!(m.confidence, 0.0);
        assert!(!m.is_known());
    }

    #[test]
    fn mismatched_dimensions_are_skipped() {
        let ids = known(&[("short", vec![1.0]), ("bob", vec![0.0, 1.0])]);
        let m = best_match(&[0.0, 1.0], &ids, 0.5);
        assert_eq!(m.identity, "bob");
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn histogram_extractor_without_model() {
        let config = crate::config::PipelineConfig::default();
        assert_eq!(select_extractor(&config.recognition).unwrap().name(), "histogram");
    }
}
