//! JPEG re-encoding via turbojpeg
//!
//! MJPG frames come off the device at whatever quality the hardware uses;
//! this transcodes them to the configured quality before publication.

use bytes::Bytes;

use super::backend::FrameEncoder;
use super::frame::RawFrame;
use crate::error::{CameraError, Result};

/// JPEG transcoder backed by libjpeg-turbo
///
/// Uses the per-call turbojpeg entry points; `turbojpeg::Compressor` is not
/// thread-safe and the session encodes from a blocking worker thread while
/// high-resolution captures may run elsewhere.
pub struct TurboJpegEncoder;

impl TurboJpegEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TurboJpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder for TurboJpegEncoder {
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes> {
        let image = turbojpeg::decompress(frame.data(), turbojpeg::PixelFormat::RGB)
            .map_err(|e| CameraError::EncodeFailure(format!("JPEG decompress failed: {e}")))?;

        let jpeg = turbojpeg::compress(
            image.as_deref(),
            quality.min(100) as i32,
            turbojpeg::Subsamp::Sub2x2,
        )
        .map_err(|e| CameraError::EncodeFailure(format!("JPEG compress failed: {e}")))?;

        Ok(Bytes::copy_from_slice(&jpeg))
    }
}
