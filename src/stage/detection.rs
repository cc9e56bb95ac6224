use std::sync::Mutex;

use anyhow::anyhow;

use super::StageProcessor;
use crate::detect::DetectorBackend;
use crate::error::PipelineError;
use crate::frame::{RawFrame, DEFAULT_JPEG_QUALITY};
use crate::record::{FaceRecord, FrameRecord};

#[derive(Clone, Debug)]
pub struct DetectionSettings {
    pub min_face_width: i32,
    pub debug_min_face_width: i32,
    /// Apply the debug width to every frame.
    pub force_debug: bool,
    pub jpeg_quality: u8,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            min_face_width: 100,
            debug_min_face_width: 50,
            force_debug: false,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl DetectionSettings {
    pub fn min_width(&self, debug: bool) -> i32 {
        if debug || self.force_debug {
            self.debug_min_face_width
        } else {
            self.min_face_width
        }
    }
}

/// Frames in, face crops out.
pub struct DetectionProcessor {
    detector: Mutex<Box<dyn DetectorBackend>>,
    settings: DetectionSettings,
}

impl DetectionProcessor {
    pub fn new(detector: Box<dyn DetectorBackend>, settings: DetectionSettings) -> Self {
        Self {
            detector: Mutex::new(detector),
            settings,
        }
    }
}

impl StageProcessor for DetectionProcessor {
    fn stage(&self) -> &'static str {
        "detection"
    }

    fn process(&self, item: &[u8]) -> Result<Vec<Vec<u8>>, PipelineError> {
        let record = FrameRecord::decode(item)?;
        let frame = RawFrame::decode_jpeg(&record.image)
            .map_err(|e| PipelineError::malformed(format!("frame image: {:#}", e)))?;

        let detections = {
            let mut detector = self.detector.lock().map_err(|_| {
                PipelineError::capability("face detection", anyhow!("detector lock poisoned"))
            })?;
            detector
                .detect(&frame)
                .map_err(|e| PipelineError::capability("face detection", e))?
        };

        let min_width = self.settings.min_width(record.debug);
        let mut faces = Vec::new();
        for detection in detections {
            let bbox = detection.bbox.clamp_to(frame.width, frame.height);
            if !bbox.is_valid() {
                log::debug!("{}: box {:?} outside frame", record.source_id, detection.bbox);
                continue;
            }
            if bbox.width() < min_width {
                log::debug!(
                    "{}: face {:?} narrower than {}px",
                    record.source_id,
                    bbox,
                    min_width
                );
                continue;
            }
            let crop = match frame
                .crop(bbox)
                .and_then(|crop| crop.encode_jpeg(self.settings.jpeg_quality))
            {
                Ok(crop) => crop,
                Err(e) => {
                    log::warn!("{}: cannot crop {:?}: {:#}", record.source_id, bbox, e);
                    continue;
                }
            };
            faces.push(
                FaceRecord {
                    source_id: record.source_id.clone(),
                    timestamp: record.timestamp,
                    debug: record.debug,
                    bbox,
                    image: crop,
                }
                .encode()?,
            );
        }
        if !faces.is_empty() {
            log::debug!(
                "{}: {} face(s) at {}",
                record.source_id,
                faces.len(),
                record.timestamp
            );
        }
        Ok(faces)
    }
}
