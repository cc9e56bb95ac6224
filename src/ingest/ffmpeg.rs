//! FFmpeg capture for RTSP streams, local files and downloaded media.
//!
//! RTSP is forced onto TCP with a bounded socket timeout. Decoded frames are
//! converted to packed RGB24.

use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use tempfile::NamedTempFile;

use super::CaptureBackend;
use crate::error::PipelineError;
use crate::frame::RawFrame;

pub(crate) struct FfmpegCapture {
    target: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: Option<f64>,
    drained: bool,
    // Keeps a downloaded file alive for as long as it is being decoded.
    _download: Option<NamedTempFile>,
}

impl FfmpegCapture {
    pub(crate) fn open_rtsp(url: &str, io_timeout: Duration) -> Result<Self, PipelineError> {
        let mut options = ffmpeg::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        options.set("timeout", &io_timeout.as_micros().to_string());
        Self::open(url, Some(options), None)
    }

    pub(crate) fn open_file(path: &Path) -> Result<Self, PipelineError> {
        Self::open(&path.display().to_string(), None, None)
    }

    pub(crate) fn open_download(file: NamedTempFile) -> Result<Self, PipelineError> {
        let path = file.path().display().to_string();
        Self::open(&path, None, Some(file))
    }

    fn open(
        target: &str,
        options: Option<ffmpeg::Dictionary>,
        download: Option<NamedTempFile>,
    ) -> Result<Self, PipelineError> {
        let fail = |reason: String| PipelineError::connection(target, reason);

        ffmpeg::init().map_err(|e| PipelineError::Startup(format!("initialize ffmpeg: {}", e)))?;
        let input = match options {
            Some(options) => ffmpeg::format::input_with_dictionary(&target, options),
            None => ffmpeg::format::input(&target),
        }
        .map_err(|e| fail(format!("open input: {}", e)))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| fail("input has no video track".to_string()))?;
        let stream_index = stream.index();
        let rate = stream.avg_frame_rate();
        let fps = (rate.denominator() != 0)
            .then(|| f64::from(rate))
            .filter(|fps| fps.is_finite() && *fps > 0.0);

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| fail(format!("load decoder parameters: {}", e)))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| fail(format!("open video decoder: {}", e)))?;
        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| fail(format!("create scaler: {}", e)))?;

        log::info!(
            "opened {} ({}x{}, fps {:?})",
            target,
            decoder.width(),
            decoder.height(),
            fps
        );

        Ok(Self {
            target: target.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            drained: false,
            _download: download,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<RawFrame, PipelineError> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .map_err(|e| PipelineError::connection(&self.target, format!("scale frame: {}", e)))?;
        frame_to_raw(&rgb).map_err(|e| PipelineError::connection(&self.target, e))
    }
}

impl CaptureBackend for FfmpegCapture {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn read_frame(&mut self) -> Result<RawFrame, PipelineError> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded);
            }
            if self.drained {
                return Err(PipelineError::EndOfStream);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder.send_packet(&packet).map_err(|e| {
                        PipelineError::connection(&self.target, format!("decode packet: {}", e))
                    })?;
                }
                Err(ffmpeg::Error::Eof) => {
                    // flush frames still buffered in the decoder
                    let _ = self.decoder.send_eof();
                    self.drained = true;
                }
                Err(e) => {
                    return Err(PipelineError::connection(
                        &self.target,
                        format!("read packet: {}", e),
                    ))
                }
            }
        }
    }
}

fn frame_to_raw(frame: &ffmpeg::frame::Video) -> anyhow::Result<RawFrame> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .ok_or_else(|| anyhow::anyhow!("ffmpeg frame is shorter than its dimensions"))?;
        return RawFrame::new(pixels.to_vec(), width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| anyhow::anyhow!("ffmpeg frame row is out of bounds"))?,
        );
    }
    RawFrame::new(pixels, width, height)
}
