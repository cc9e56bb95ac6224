//! Decoded RGB frames and the JPEG boundary.
//!
//! Capture backends hand the source reader `RawFrame`s (packed RGB24). Only
//! sampled frames are JPEG-encoded before they enter the `frames` queue, so the
//! skipped majority never pays for compression.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::record::BBox;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Packed RGB24 pixels, row-major, no padding.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
}

impl RawFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(&self.pixels, self.width, self.height, ExtendedColorType::Rgb8)
            .context("encode frame as JPEG")?;
        Ok(out)
    }

    pub fn decode_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
            .context("decode JPEG")?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// Cut `bbox` out of the frame. The box must already lie inside the frame.
    pub fn crop(&self, bbox: BBox) -> Result<Self> {
        if !bbox.is_valid() || bbox.clamp_to(self.width, self.height) != bbox {
            return Err(anyhow!(
                "bbox {:?} does not fit in {}x{} frame",
                bbox,
                self.width,
                self.height
            ));
        }
        let image = RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let crop = image::imageops::crop_imm(
            &image,
            bbox.x1 as u32,
            bbox.y1 as u32,
            bbox.width() as u32,
            bbox.height() as u32,
        )
        .to_image();
        let (width, height) = crop.dimensions();
        Self::new(crop.into_raw(), width, height)
    }
}
