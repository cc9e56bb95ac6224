//! Records that travel between pipeline stages.

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::PipelineError;

/// Identity reported when no known identity clears the similarity threshold.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Axis-aligned pixel box `(x1, y1, x2, y2)`, serialized as a 4-element array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// True when `x1 < x2` and `y1 < y2`.
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Clamp the box to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let w = i32::try_from(width).unwrap_or(i32::MAX);
        let h = i32::try_from(height).unwrap_or(i32::MAX);
        Self {
            x1: self.x1.clamp(0, w),
            y1: self.y1.clamp(0, h),
            x2: self.x2.clamp(0, w),
            y2: self.y2.clamp(0, h),
        }
    }

    /// `x1_y1_x2_y2`, as used in result keys.
    pub fn key_fragment(&self) -> String {
        format!("{}_{}_{}_{}", self.x1, self.y1, self.x2, self.y2)
    }
}

impl From<[i32; 4]> for BBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameMeta {
    source_id: String,
    timestamp: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    debug: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct FaceMeta {
    source_id: String,
    timestamp: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    debug: bool,
    bbox: BBox,
}

/// A sampled frame: JPEG bytes plus where and when it was captured.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameRecord {
    pub source_id: String,
    /// Unix seconds.
    pub timestamp: f64,
    /// Source was started in debug mode (relaxed face width filter).
    pub debug: bool,
    pub image: Vec<u8>,
}

impl FrameRecord {
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        let meta = FrameMeta {
            source_id: self.source_id.clone(),
            timestamp: self.timestamp,
            debug: self.debug,
        };
        codec::encode(&meta, &self.image)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let (meta, image): (FrameMeta, &[u8]) = codec::decode(bytes)?;
        Ok(Self {
            source_id: meta.source_id,
            timestamp: meta.timestamp,
            debug: meta.debug,
            image: image.to_vec(),
        })
    }
}

/// A face crop cut from a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceRecord {
    pub source_id: String,
    pub timestamp: f64,
    pub debug: bool,
    pub bbox: BBox,
    /// JPEG crop, `bbox.width()` x `bbox.height()` pixels.
    pub image: Vec<u8>,
}

impl FaceRecord {
    pub fn encode(&self) -> Result<Vec<u8>, PipelineError> {
        let meta = FaceMeta {
            source_id: self.source_id.clone(),
            timestamp: self.timestamp,
            debug: self.debug,
            bbox: self.bbox,
        };
        codec::encode(&meta, &self.image)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let (meta, image): (FaceMeta, &[u8]) = codec::decode(bytes)?;
        Ok(Self {
            source_id: meta.source_id,
            timestamp: meta.timestamp,
            debug: meta.debug,
            bbox: meta.bbox,
            image: image.to_vec(),
        })
    }
}

/// Outcome of matching one face against the known identities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub source_id: String,
    pub timestamp: f64,
    pub bbox: BBox,
    /// Matched identity or [`UNKNOWN_IDENTITY`].
    pub identity: String,
    /// Best similarity in `[0, 1]`, reported even when below threshold.
    pub confidence: f64,
    pub processed_at: f64,
}

impl RecognitionResult {
    pub fn is_unknown(&self) -> bool {
        self.identity == UNKNOWN_IDENTITY
    }

    /// `source_id:timestamp:x1_y1_x2_y2`. Whole-second timestamps keep a
    /// trailing `.0`.
    pub fn store_key(&self) -> String {
        let timestamp = if self.timestamp.is_finite() && self.timestamp.fract() == 0.0 {
            format!("{:.1}", self.timestamp)
        } else {
            self.timestamp.to_string()
        };
        format!(
            "{}:{}:{}",
            self.source_id,
            timestamp,
            self.bbox.key_fragment()
        )
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(self)
            .map_err(|e| PipelineError::malformed(format!("result not serializable: {}", e)))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::malformed(format!("invalid recognition result: {}", e)))
    }
}

/// A recognition result held by the result store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub key: String,
    #[serde(flatten)]
    pub result: RecognitionResult,
}

impl From<RecognitionResult> for StoredResult {
    fn from(result: RecognitionResult) -> Self {
        Self {
            key: result.store_key(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> RecognitionResult {
        RecognitionResult {
            source_id: "stream_0".to_string(),
            timestamp: 1700000000.5,
            bbox: BBox::new(10, 20, 130, 160),
            identity: UNKNOWN_IDENTITY.to_string(),
            confidence: 0.55,
            processed_at: 1700000001.0,
        }
    }

    #[test]
    fn bbox_serializes_as_array() {
        let json = serde_json::to_string(&BBox::new(1, 2, 3, 4)).unwrap();
        assert_eq!(json, "[1,2,3,4]");
        let back: BBox = serde_json::from_str("[5,6,7,8]").unwrap();
        assert_eq!(back, BBox::new(5, 6, 7, 8));
    }

    #[test]
    fn bbox_clamps_to_frame() {
        let clamped = BBox::new(-5, 10, 700, 500).clamp_to(640, 480);
        assert_eq!(clamped, BBox::new(0, 10, 640, 480));
        assert!(clamped.is_valid());

        let outside = BBox::new(700, 10, 800, 50).clamp_to(640, 480);
        assert!(!outside.is_valid());
    }

    #[test]
    fn frame_record_round_trips_through_codec() {
        let frame = FrameRecord {
            source_id: "stream_3".to_string(),
            timestamp: 1700000000.125,
            debug: true,
            image: vec![1, 2, 3, 4, 5],
        };
        let back = FrameRecord::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn face_record_metadata_carries_bbox() {
        let face = FaceRecord {
            source_id: "stream_1".to_string(),
            timestamp: 12.5,
            debug: false,
            bbox: BBox::new(0, 0, 120, 90),
            image: vec![9; 16],
        };
        let bytes = face.encode().unwrap();
        let (meta, payload): (serde_json::Value, &[u8]) = codec::decode(&bytes).unwrap();
        assert_eq!(meta["bbox"], serde_json::json!([0, 0, 120, 90]));
        assert!(meta.get("debug").is_none());
        assert_eq!(payload, &[9u8; 16][..]);
        assert_eq!(FaceRecord::decode(&bytes).unwrap(), face);
    }

    #[test]
    fn frame_decode_rejects_missing_fields() {
        let bytes = codec::encode(&serde_json::json!({"timestamp": 1.0}), b"img").unwrap();
        assert!(matches!(
            FrameRecord::decode(&bytes),
            Err(PipelineError::MalformedFrame(_))
        ));
    }

    #[test]
    fn store_key_joins_bbox_with_underscores() {
        assert_eq!(sample_result().store_key(), "stream_0:1700000000.5:10_20_130_160");
    }

    #[test]
    fn store_key_keeps_a_decimal_point_on_whole_seconds() {
        let mut result = sample_result();
        result.timestamp = 1_700_000_000.0;
        assert_eq!(result.store_key(), "stream_0:1700000000.0:10_20_130_160");
        result.timestamp = 0.25;
        assert_eq!(result.store_key(), "stream_0:0.25:10_20_130_160");
    }

    #[test]
    fn recognition_result_is_plain_json() {
        let result = sample_result();
        let json = result.to_json().unwrap();
        assert_eq!(json[0], b'{');
        assert_eq!(RecognitionResult::from_json(&json).unwrap(), result);
        assert!(RecognitionResult::from_json(b"not json").is_err());
    }
}
