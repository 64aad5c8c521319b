//! camkit - USB camera probing and MJPEG streaming sessions
//!
//! This crate detects usable V4L2 capture devices and runs streaming
//! capture sessions that publish the latest JPEG-encoded frame to
//! concurrent readers, with automatic reconnection and one-shot
//! high-resolution captures.

pub mod camera;
pub mod config;
pub mod error;
pub mod utils;

pub use camera::{detect, CameraSession, ProbedCamera};
pub use config::CaptureConfig;
pub use error::{CameraError, Result};
