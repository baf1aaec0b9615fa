//! Capture device abstraction: frames, render targets and device events.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::borrow::Cow;
use tokio::sync::broadcast;

use crate::error::DeviceError;

/// Capacity of a device's event channel. Events are rare (one per
/// open/close), so a handful of slots is plenty.
pub const DEVICE_EVENT_CAPACITY: usize = 16;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit greyscale, one byte per pixel.
    Luma8,
    /// Packed 8-bit RGB.
    Rgb8,
    /// Packed 8-bit RGBA.
    Rgba8,
}

impl PixelFormat {
    /// Size of one pixel in bytes.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Luma8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Snapshot of the current video frame, ready to hand to a decode engine.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
    /// Monotonic per-device frame counter.
    pub sequence: u64,
}

impl Frame {
    /// Build a greyscale frame.
    pub fn luma(width: u32, height: u32, data: impl Into<Bytes>, sequence: u64) -> Self {
        Frame {
            width,
            height,
            format: PixelFormat::Luma8,
            data: data.into(),
            sequence,
        }
    }

    /// Whether `data` holds exactly `width * height` pixels of `format`.
    pub fn is_well_formed(&self) -> bool {
        let pixels = self.width as usize * self.height as usize;
        self.data.len() == pixels * self.format.bytes_per_pixel()
    }

    /// Greyscale view of the frame, converting colour frames with integer
    /// BT.601 weights. `None` if the buffer size does not match the header.
    pub fn to_luma(&self) -> Option<Cow<'_, [u8]>> {
        if !self.is_well_formed() {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        match self.format {
            PixelFormat::Luma8 => Some(Cow::Borrowed(&self.data[..])),
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => Some(Cow::Owned(
                self.data
                    .chunks_exact(bpp)
                    .map(|px| {
                        let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
                        ((r * 77 + g * 150 + b * 29) >> 8) as u8
                    })
                    .collect(),
            )),
        }
    }
}

/// How the video surface fills its render region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFit {
    /// Fill the region, cropping the overflow.
    #[default]
    Cover,
    /// Letterbox the whole frame inside the region.
    Contain,
}

/// Host-owned region the device renders its preview into.
///
/// The controller only borrows it for binding; creating and destroying the
/// region is the host's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    /// Describe a `width` x `height` surface the host knows as `id`.
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        RenderTarget {
            id: id.into(),
            width,
            height,
        }
    }
}

/// Stream details reported when the device starts producing frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackInfo {
    pub width: u32,
    pub height: u32,
    pub device_id: String,
}

/// Lifecycle events emitted by a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The stream is actually producing frames.
    Played(PlaybackInfo),
    /// The stream ended: explicit close, user action or device loss.
    Closed,
}

/// A camera the controller can open, close and pull frames from.
///
/// Implementations broadcast [`DeviceEvent`]s to every receiver handed out by
/// [`subscribe`](Self::subscribe). Opening does not imply frames are flowing;
/// that is what [`DeviceEvent::Played`] is for.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Human-readable name, used for logging.
    fn label(&self) -> &str;

    /// Attach the preview surface to a host region.
    async fn bind(&self, target: &RenderTarget) -> Result<(), DeviceError>;

    fn set_video_fit(&self, fit: VideoFit);

    /// Start (or resume) the camera stream.
    async fn open(&self) -> Result<(), DeviceError>;

    /// Stop the camera stream. Closing a closed device is not an error.
    async fn close(&self) -> Result<(), DeviceError>;

    /// Grab the most recent frame.
    async fn frame(&self) -> Result<Frame, DeviceError>;

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}
