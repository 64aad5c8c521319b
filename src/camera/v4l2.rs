//! V4L2 device layer
//!
//! Production [`DeviceOpener`]/[`FrameSource`] over the `v4l` crate using
//! memory-mapped capture buffers.

use bytes::Bytes;
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::backend::{Backend, DeviceOpener, FrameSource, Negotiated, StreamProfile};
use super::format::Resolution;
use super::frame::{is_valid_jpeg, RawFrame, MIN_FRAME_SIZE};
use crate::error::{CameraError, Result};

/// Number of mmap capture buffers (2 keeps latency low)
const BUFFER_COUNT: u32 = 2;

/// Opens V4L2 devices
pub struct V4l2Opener;

impl DeviceOpener for V4l2Opener {
    fn open(
        &self,
        index: u32,
        backend: Backend,
        profile: &StreamProfile,
    ) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(V4l2Source::open(index, backend, profile)?))
    }
}

/// An open V4L2 capture handle with an active mmap stream
pub struct V4l2Source {
    // Held so the fd stays open for the stream's lifetime
    _device: Device,
    // The stream clones the device handle internally, so the borrow of
    // `Device` ends at construction and 'static is accurate here
    stream: MmapStream<'static>,
    negotiated: Negotiated,
}

impl V4l2Source {
    pub fn open(index: u32, backend: Backend, profile: &StreamProfile) -> Result<Self> {
        let device = match backend {
            Backend::V4l2 => Device::new(index as usize),
            Backend::Auto => Device::with_path(format!("/dev/video{index}")),
        }
        .map_err(|e| {
            CameraError::DeviceUnavailable(format!("Failed to open device {index}: {e}"))
        })?;

        let requested = Format::new(
            profile.resolution.width,
            profile.resolution.height,
            FourCC::new(&profile.fourcc.0),
        );
        let actual = device.set_format(&requested).map_err(|e| {
            CameraError::DeviceUnavailable(format!("Failed to set format on device {index}: {e}"))
        })?;

        if actual.width != requested.width || actual.height != requested.height {
            warn!(
                "Device {} granted {}x{} instead of {}",
                index, actual.width, actual.height, profile.resolution
            );
        }

        let fps = match device.set_params(&Parameters::with_fps(profile.fps)) {
            Ok(params) if params.interval.numerator > 0 => {
                params.interval.denominator / params.interval.numerator
            }
            Ok(_) => profile.fps,
            Err(e) => {
                // Some drivers reject frame interval negotiation entirely
                debug!("Device {} does not take a frame rate: {}", index, e);
                profile.fps
            }
        };

        let stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(|e| {
                CameraError::DeviceUnavailable(format!(
                    "Failed to start stream on device {index}: {e}"
                ))
            })?;

        let negotiated = Negotiated {
            resolution: Resolution::new(actual.width, actual.height),
            fps,
        };
        debug!(
            "Opened device {} via {}: {}@{}fps",
            index, backend, negotiated.resolution, negotiated.fps
        );

        Ok(Self {
            _device: device,
            stream,
            negotiated,
        })
    }
}

impl FrameSource for V4l2Source {
    fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    fn read(&mut self) -> Result<RawFrame> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::ReadFailure(e.to_string()))?;

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_SIZE {
            return Err(CameraError::ReadFailure(format!(
                "Undersized frame: {used} bytes"
            )));
        }
        // Drivers occasionally dequeue a buffer that is not a JPEG at all
        if !is_valid_jpeg(&buf[..used]) {
            return Err(CameraError::ReadFailure(format!(
                "Corrupt MJPG frame: {used} bytes with bad markers"
            )));
        }

        Ok(RawFrame::new(
            Bytes::copy_from_slice(&buf[..used]),
            self.negotiated.resolution,
        ))
    }
}
