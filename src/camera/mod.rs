//! Camera probing and capture
//!
//! Device access abstraction, the V4L2 implementation of it, the detection
//! scan and the streaming capture session.

pub mod backend;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod probe;
pub mod session;
pub mod v4l2;

pub use backend::{Backend, DeviceOpener, FrameEncoder, FrameSource, Negotiated, StreamProfile};
pub use encoder::TurboJpegEncoder;
pub use format::{FourCc, Resolution};
pub use frame::RawFrame;
pub use probe::{detect, ProbedCamera};
pub use session::CameraSession;
pub use v4l2::{V4l2Opener, V4l2Source};
