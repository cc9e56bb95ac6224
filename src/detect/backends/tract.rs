#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, Detection};
use crate::frame::RawFrame;
use crate::record::BBox;

/// ONNX face detector run through tract.
///
/// Expects a YOLO-style model: input `1x3xHxW` RGB in `[0, 1]`, output rows of
/// `(cx, cy, w, h, score, ...)` in input pixels, either `1xNxK` or the
/// transposed `1xKxN` layout. Frames are resized to the input size and boxes
/// scaled back.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.4,
            iou_threshold: 0.5,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &RawFrame) -> Result<Tensor> {
        let image = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = if (frame.width, frame.height) == (self.width, self.height) {
            image
        } else {
            image::imageops::resize(&image, self.width, self.height, FilterType::Triangle)
        };

        let width = self.width as usize;
        let pixels = resized.as_raw();
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn parse_output(&self, outputs: TVec<TValue>, frame: &RawFrame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let rows = view
            .into_shape((shape[1], shape[2]))
            .context("reshape detector output")?;
        // YOLOv8 exports put attributes first
        let rows = if shape[1] < shape[2] { rows.reversed_axes() } else { rows };
        if rows.ncols() < 5 {
            return Err(anyhow!("detector rows carry {} values, need 5", rows.ncols()));
        }

        let sx = frame.width as f32 / self.width as f32;
        let sy = frame.height as f32 / self.height as f32;
        let mut detections = Vec::new();
        for row in rows.rows() {
            let score = row[4];
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = BBox::new(
                ((cx - w / 2.0) * sx).round() as i32,
                ((cy - h / 2.0) * sy).round() as i32,
                ((cx + w / 2.0) * sx).round() as i32,
                ((cy + h / 2.0) * sy).round() as i32,
            );
            detections.push(Detection::face(bbox, score));
        }
        Ok(non_max_suppression(
            detections,
            self.confidence_threshold,
            self.iou_threshold,
        ))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &RawFrame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.parse_output(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RawFrame::new(
            vec![0; self.width as usize * self.height as usize * 3],
            self.width,
            self.height,
        )?;
        self.detect(&blank).map(|_| ())
    }
}
