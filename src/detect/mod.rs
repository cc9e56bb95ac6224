//! Face detection capability and backends.

use anyhow::Result;

use crate::config::DetectionConfig;

mod backend;
mod backends;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{iou, non_max_suppression, Detection, FACE_LABEL};

/// Input size of the ONNX detector, in pixels per side.
pub const MODEL_INPUT_SIZE: u32 = 640;

/// Detector named by the config: the ONNX model when one is configured,
/// otherwise the stub.
pub fn select_detector(config: &DetectionConfig) -> Result<Box<dyn DetectorBackend>> {
    match &config.model_path {
        #[cfg(feature = "backend-tract")]
        Some(path) => Ok(Box::new(
            TractBackend::new(path, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)?
                .with_thresholds(config.confidence, config.iou),
        )),
        #[cfg(not(feature = "backend-tract"))]
        Some(path) => Err(anyhow::anyhow!(
            "detection model {} requires the backend-tract feature",
            path.display()
        )),
        None => {
            log::warn!("no detection model configured; using the stub detector");
            Ok(Box::new(StubBackend::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn stub_without_model() {
        let config = PipelineConfig::default();
        assert_eq!(select_detector(&config.detection).unwrap().name(), "stub");
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn model_without_backend_is_an_error() {
        let mut config = PipelineConfig::default();
        config.detection.model_path = Some("/models/faces.onnx".into());
        let err = select_detector(&config.detection).err().unwrap();
        assert!(err.to_string().contains("backend-tract"));
    }
}
