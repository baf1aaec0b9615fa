//! Error types for the scan controller and its collaborators.

use thiserror::Error;

/// Result alias for controller operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors surfaced to the host by [`ScanController`](crate::ScanController).
///
/// Only initialization is a hard failure. Everything that goes wrong while
/// the scan loop is running is logged and absorbed.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scanner initialization failed: {0}")]
    Initialization(#[from] InitError),

    #[error("scanner has been disposed")]
    Disposed,
}

/// Why collaborator setup failed.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create decode engine: {0}")]
    Decoder(#[source] DecodeError),

    #[error("failed to create capture device: {0}")]
    Device(#[source] DeviceError),

    #[error("failed to bind capture device to render target '{target}': {source}")]
    Bind {
        target: String,
        #[source]
        source: DeviceError,
    },
}

/// Capture device failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("camera permission denied")]
    PermissionDenied,

    #[error("camera not found: {0}")]
    NotFound(String),

    #[error("camera is not streaming")]
    NotStreaming,

    #[error("capture device is gone")]
    Disconnected,

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Decode engine failures.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode engine failed to load: {0}")]
    Load(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("decode failed: {0}")]
    Engine(String),
}
