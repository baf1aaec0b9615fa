//! Collaborator factory used by the controller during initialization.

use async_trait::async_trait;
use std::sync::Arc;

use crate::codec::{DecodeEngine, DecoderSetup};
use crate::error::{DecodeError, DeviceError};
use crate::video::CaptureDevice;

/// Creates the capture device and decode engine a controller will own.
///
/// Both calls may be slow (engine resources loading, camera permission
/// prompts) and are awaited once per successful initialization.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    async fn create_decoder(&self, setup: &DecoderSetup) -> Result<Arc<dyn DecodeEngine>, DecodeError>;

    async fn create_device(&self) -> Result<Arc<dyn CaptureDevice>, DeviceError>;
}

/// Local webcam plus the bundled QR engine.
#[cfg(all(feature = "camera", feature = "qr"))]
#[derive(Debug, Clone, Default)]
pub struct NativeBackend {
    camera_index: u32,
}

#[cfg(all(feature = "camera", feature = "qr"))]
impl NativeBackend {
    /// Use the camera at `camera_index` in the platform's device list.
    pub fn new(camera_index: u32) -> Self {
        NativeBackend { camera_index }
    }
}

#[cfg(all(feature = "camera", feature = "qr"))]
#[async_trait]
impl ScanBackend for NativeBackend {
    async fn create_decoder(&self, setup: &DecoderSetup) -> Result<Arc<dyn DecodeEngine>, DecodeError> {
        if setup.license.is_some() {
            tracing::debug!("QR engine needs no license, ignoring the configured one");
        }
        Ok(Arc::new(crate::codec::QrDecoder::new()))
    }

    async fn create_device(&self) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        // Enumeration blocks, and may sit behind an OS permission prompt.
        let index = self.camera_index;
        let camera = tokio::task::spawn_blocking(move || crate::camera::NativeCamera::spawn(index))
            .await
            .map_err(|e| DeviceError::Capture(format!("camera lookup task failed: {}", e)))??;
        Ok(Arc::new(camera))
    }
}
