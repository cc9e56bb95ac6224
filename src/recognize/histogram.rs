use anyhow::{anyhow, Result};

use super::{l2_normalize, FeatureExtractor};
use crate::frame::RawFrame;

const BINS: usize = 8;
const GRID: usize = 2;

/// Spatial colour histogram features.
///
/// The crop is split into a 2x2 grid; each cell contributes an 8-bin
/// histogram per RGB channel, normalised by cell size. The concatenated
/// 96-value vector is L2-normalised. Cheap and dependency-free; good enough
/// to match the same synthetic face across frames, not to identify people.
#[derive(Clone, Debug, Default)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    pub const DIMENSIONS: usize = GRID * GRID * 3 * BINS;

    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn extract(&mut self, image: &RawFrame) -> Result<Vec<f32>> {
        let (width, height) = (image.width as usize, image.height as usize);
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot extract features from an empty image"));
        }

        let mut features = vec![0f32; Self::DIMENSIONS];
        let mut cell_pixels = [0u32; GRID * GRID];
        for (i, px) in image.pixels().chunks_exact(3).enumerate() {
            let (x, y) = (i % width, i / width);
            let cell = (y * GRID / height) * GRID + (x * GRID / width);
            cell_pixels[cell] += 1;
            for (channel, &value) in px.iter().enumerate() {
                let bin = value as usize * BINS / 256;
                features[(cell * 3 + channel) * BINS + bin] += 1.0;
            }
        }

        for (cell, &count) in cell_pixels.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let start = cell * 3 * BINS;
            for v in &mut features[start..start + 3 * BINS] {
                *v /= count as f32;
            }
        }
        Ok(l2_normalize(features))
    }
}
