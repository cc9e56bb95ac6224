use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use super::{l2_normalize, FeatureExtractor};
use crate::frame::RawFrame;

/// ONNX face embedding model run through tract.
///
/// Input `1x3xSxS` RGB scaled to `[-1, 1]`; the first output is flattened
/// and L2-normalised.
pub struct TractEmbedder {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    size: u32,
}

impl TractEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P, size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size as usize, size as usize)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        Ok(Self { model, size })
    }
}

impl FeatureExtractor for TractEmbedder {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn extract(&mut self, image: &RawFrame) -> Result<Vec<f32>> {
        let rgb = RgbImage::from_raw(image.width, image.height, image.pixels().to_vec())
            .ok_or_else(|| anyhow!("crop buffer does not match its dimensions"))?;
        let resized = image::imageops::resize(&rgb, self.size, self.size, FilterType::Triangle);
        let size = self.size as usize;
        let pixels = resized.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            pixels[(y * size + x) * 3 + c] as f32 / 127.5 - 1.0
        });

        let outputs = self
            .model
            .run(tvec!(input.into_tensor().into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let embedding: Vec<f32> = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .copied()
            .collect();
        if embedding.is_empty() {
            return Err(anyhow!("model produced an empty embedding"));
        }
        Ok(l2_normalize(embedding))
    }
}
