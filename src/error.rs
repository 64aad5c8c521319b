use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device read failed: {0}")]
    ReadFailure(String),

    #[error("JPEG encode failed: {0}")]
    EncodeFailure(String),

    #[error("High-resolution capture failed: {0}")]
    HighResCapture(String),

    #[error("Background task failed: {0}")]
    TaskFailure(String),
}

/// Result type alias for camera operations
pub type Result<T> = std::result::Result<T, CameraError>;
