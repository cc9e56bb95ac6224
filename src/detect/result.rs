use crate::record::BBox;

/// Label reported by face detectors.
pub const FACE_LABEL: &str = "face";

/// One detected box in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn face(bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            label: FACE_LABEL.to_string(),
            confidence,
        }
    }
}

/// Intersection over union of two boxes. Zero for empty boxes.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);
    let inter = (ix2 - ix1).max(0) as i64 * (iy2 - iy1).max(0) as i64;
    let area = |r: &BBox| r.width().max(0) as i64 * r.height().max(0) as i64;
    let union = area(a) + area(b) - inter;
    if union <= 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

/// Greedy non-maximum suppression.
///
/// Drops detections below `min_confidence`, then keeps the most confident box
/// of every cluster whose pairwise IoU exceeds `iou_threshold`.
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    min_confidence: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    detections.retain(|d| d.confidence >= min_confidence);
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}
