use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::RawFrame;
use crate::record::BBox;

/// Deterministic detector for tests and synthetic sources.
///
/// Reports either a fixed list of boxes or one centred square on every frame.
#[derive(Clone, Debug)]
pub struct StubBackend {
    mode: StubMode,
}

#[derive(Clone, Debug)]
enum StubMode {
    Fixed(Vec<Detection>),
    Centered { size: i32, confidence: f32 },
}

impl StubBackend {
    /// Return `detections` unchanged for every frame.
    pub fn fixed(detections: Vec<Detection>) -> Self {
        Self {
            mode: StubMode::Fixed(detections),
        }
    }

    /// One `size` x `size` face centred in each frame.
    pub fn centered(size: i32, confidence: f32) -> Self {
        Self {
            mode: StubMode::Centered { size, confidence },
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::centered(120, 0.9)
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>> {
        match &self.mode {
            StubMode::Fixed(detections) => Ok(detections.clone()),
            StubMode::Centered { size, confidence } => {
                let cx = (frame.width / 2) as i32;
                let cy = (frame.height / 2) as i32;
                let half = size / 2;
                let bbox = BBox::new(cx - half, cy - half, cx - half + size, cy - half + size);
                Ok(vec![Detection::face(bbox, *confidence)])
            }
        }
    }
}
