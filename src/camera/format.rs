//! Resolution and pixel format identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Four-character pixel format code as negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    /// MJPEG compressed format (the one format this crate negotiates)
    pub const MJPG: FourCc = FourCc(*b"MJPG");
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether this resolution achieves at least `ratio` of the requested
    /// one in both dimensions
    pub fn covers(&self, requested: Resolution, ratio: f64) -> bool {
        self.width as f64 >= requested.width as f64 * ratio
            && self.height as f64 >= requested.height as f64 * ratio
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    pub const UHD4K: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}
