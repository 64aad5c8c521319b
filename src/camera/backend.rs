//! Device access abstraction
//!
//! The probe and the capture session only depend on these traits; the
//! production implementation over V4L2 lives in [`super::v4l2`].

use std::fmt;

use bytes::Bytes;

use super::format::{FourCc, Resolution};
use super::frame::RawFrame;
use crate::error::Result;

/// Low-level device access strategy
///
/// Candidates are tried in order by the probe until one yields a usable
/// handle. The streaming session always uses [`Backend::V4l2`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Open by device index
    V4l2,
    /// Open by /dev/videoN path
    Auto,
}

impl Backend {
    /// Probe candidates, in the order they are attempted
    pub const CANDIDATES: &'static [Backend] = &[Backend::V4l2, Backend::Auto];

    /// Human-readable name, embedded in probe labels
    pub fn name(&self) -> &'static str {
        match self {
            Backend::V4l2 => "V4L2",
            Backend::Auto => "Auto",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Requested device configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    pub fps: u32,
}

/// Parameters the device actually granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub resolution: Resolution,
    pub fps: u32,
}

/// An open, configured device handle
///
/// Exclusively owned; dropping it releases the device exactly once.
pub trait FrameSource: Send {
    /// Parameters the device granted when the handle was opened
    fn negotiated(&self) -> Negotiated;

    /// Blocking read of the next frame
    fn read(&mut self) -> Result<RawFrame>;
}

/// Opens and configures device handles
pub trait DeviceOpener: Send + Sync {
    /// Open device `index` via `backend` and apply `profile`
    ///
    /// Failures of any step (open, format, frame interval) are reported as
    /// `CameraError::DeviceUnavailable`.
    fn open(
        &self,
        index: u32,
        backend: Backend,
        profile: &StreamProfile,
    ) -> Result<Box<dyn FrameSource>>;
}

/// External codec collaborator
pub trait FrameEncoder: Send + Sync {
    /// Encode a raw frame to JPEG at the given quality (1-100)
    fn encode(&self, frame: &RawFrame, quality: u8) -> Result<Bytes>;
}
