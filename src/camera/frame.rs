//! Raw frame data structures

use bytes::Bytes;

use super::format::Resolution;

/// Minimum plausible frame size in bytes; anything smaller is driver noise
pub const MIN_FRAME_SIZE: usize = 128;

/// A raw frame as read from the device, before re-encoding
#[derive(Debug, Clone)]
pub struct RawFrame {
    data: Bytes,
    /// Resolution the frame was captured at
    pub resolution: Resolution,
}

impl RawFrame {
    pub fn new(data: Bytes, resolution: Resolution) -> Self {
        Self { data, resolution }
    }

    /// Create a frame from a Vec<u8>
    pub fn from_vec(data: Vec<u8>, resolution: Resolution) -> Self {
        Self::new(Bytes::from(data), resolution)
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

/// Validate JPEG frame data by its start and end markers
pub fn is_valid_jpeg(data: &[u8]) -> bool {
    if data.len() < MIN_FRAME_SIZE {
        return false;
    }

    // Check start marker (0xFFD8)
    let start_marker = ((data[0] as u16) << 8) | data[1] as u16;
    if start_marker != 0xFFD8 {
        return false;
    }

    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;

    // Valid end markers: 0xFFD9, 0xD900, 0x0000 (padded)
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}
