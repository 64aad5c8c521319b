//! Camera detection scan
//!
//! One-shot diagnostic that walks a small index range and reports which
//! devices produce a usable frame. Holds no resources past the scan.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::{Backend, DeviceOpener, StreamProfile};
use super::format::{FourCc, Resolution};
use super::v4l2::V4l2Opener;

/// Indices scanned by [`detect`]
const SCAN_RANGE: Range<u32> = 0..10;
/// Resolution candidates, highest first; the first accepted one wins
const RESOLUTION_CANDIDATES: &[Resolution] =
    &[Resolution::HD1080, Resolution::HD720, Resolution::VGA];
/// Frame rate requested while probing
const PROBE_FPS: u32 = 30;
/// A readback frame must reach this fraction of the requested dimensions
const ACCEPT_RATIO: f64 = 0.9;

/// A functioning camera found during a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbedCamera {
    /// Device index
    pub index: u32,
    /// Human-readable label embedding backend and achieved parameters
    pub label: String,
}

/// Detect available cameras on the default V4L2 device layer
pub fn detect() -> Vec<ProbedCamera> {
    scan(&V4l2Opener, SCAN_RANGE)
}

/// Scan `range` for usable cameras via `opener`
///
/// Per-index failures of any kind are expected "no device here" outcomes;
/// the scan always runs the whole range and returns results in ascending
/// index order.
pub fn scan(opener: &dyn DeviceOpener, range: Range<u32>) -> Vec<ProbedCamera> {
    info!("Scanning for cameras (indices {}..{})", range.start, range.end);
    let mut cameras = Vec::new();

    for index in range {
        match probe_index(opener, index) {
            Some(camera) => {
                info!("Found working camera: {}", camera.label);
                cameras.push(camera);
            }
            None => debug!("No usable camera at index {}", index),
        }
    }

    info!("Scan complete, {} camera(s) found", cameras.len());
    cameras
}

/// Try every (backend, resolution) candidate pair for one index
fn probe_index(opener: &dyn DeviceOpener, index: u32) -> Option<ProbedCamera> {
    for &backend in Backend::CANDIDATES {
        for &resolution in RESOLUTION_CANDIDATES {
            let profile = StreamProfile {
                fourcc: FourCc::MJPG,
                resolution,
                fps: PROBE_FPS,
            };
            let mut source = match opener.open(index, backend, &profile) {
                Ok(source) => source,
                Err(e) => {
                    debug!("Index {} via {} at {}: {}", index, backend, resolution, e);
                    continue;
                }
            };

            // Validating readback: accept only if the frame actually has
            // (close to) the requested dimensions
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Index {} readback failed: {}", index, e);
                    continue;
                }
            };
            if !frame.resolution.covers(resolution, ACCEPT_RATIO) {
                debug!(
                    "Index {}: {} not supported (got {})",
                    index, resolution, frame.resolution
                );
                continue;
            }

            let granted = source.negotiated();
            let label = format!(
                "Camera {} ({}) - {}@{}fps",
                index, backend, granted.resolution, granted.fps
            );
            // Handle released here, before the next index is probed
            drop(source);
            return Some(ProbedCamera { index, label });
        }
    }
    None
}
