//! Capture session configuration

use std::time::Duration;

use crate::camera::backend::StreamProfile;
use crate::camera::format::{FourCc, Resolution};

/// Default consecutive read failures before a reconnect attempt
const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
/// Default delay between reconnect attempts
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Default bound on waiting for the polling task to exit
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture session configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device index (maps to /dev/videoN)
    pub device_index: u32,
    /// Streaming resolution
    pub resolution: Resolution,
    /// Streaming frame rate
    pub fps: u32,
    /// JPEG quality for streamed frames (1-100)
    pub stream_quality: u8,
    /// Resolution for one-shot high-resolution captures
    pub high_res: Resolution,
    /// JPEG quality for high-resolution captures (1-100)
    pub high_res_quality: u8,
    /// Delay between reconnect attempts after the device drops
    pub reconnect_delay: Duration,
    /// How long `stop` waits for the polling task to acknowledge
    pub stop_timeout: Duration,
    /// Consecutive failed reads that trigger a reconnect
    pub read_failure_threshold: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            resolution: Resolution::HD720,
            fps: 30,
            stream_quality: 70,
            high_res: Resolution::UHD4K,
            high_res_quality: 95,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            read_failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl CaptureConfig {
    /// Create config for a specific device index
    pub fn for_device(index: u32) -> Self {
        Self {
            device_index: index,
            ..Default::default()
        }
    }

    /// Set streaming resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// Set streaming frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set streaming JPEG quality
    pub fn with_stream_quality(mut self, quality: u8) -> Self {
        self.stream_quality = quality.min(100);
        self
    }

    /// Set high-resolution capture parameters
    pub fn with_high_res(mut self, width: u32, height: u32, quality: u8) -> Self {
        self.high_res = Resolution::new(width, height);
        self.high_res_quality = quality.min(100);
        self
    }

    /// Profile the streaming handle is opened with
    pub fn stream_profile(&self) -> StreamProfile {
        StreamProfile {
            fourcc: FourCc::MJPG,
            resolution: self.resolution,
            fps: self.fps,
        }
    }

    /// Profile the one-shot high-resolution handle is opened with
    pub fn high_res_profile(&self) -> StreamProfile {
        StreamProfile {
            fourcc: FourCc::MJPG,
            resolution: self.high_res,
            fps: self.fps,
        }
    }
}
