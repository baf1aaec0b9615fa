//! Host-facing settings and callbacks.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{DecodeEngine, Symbol};
use crate::video::{CaptureDevice, PlaybackInfo, VideoFit};

/// Default decode period: 25 decodes per second at most.
pub const DEFAULT_INTERVAL_MS: u64 = 40;

/// Plain-data scanner settings. Missing fields take their defaults, so a
/// host can embed this in its own config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Camera activation intent at construction time.
    pub active: bool,
    /// Decode period in milliseconds. 0 means the default.
    pub interval_ms: u64,
    /// Credential handed to the decode engine's setup.
    pub license: Option<String>,
    pub video_fit: VideoFit,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        ScannerSettings {
            active: false,
            interval_ms: DEFAULT_INTERVAL_MS,
            license: None,
            video_fit: VideoFit::default(),
        }
    }
}

impl ScannerSettings {
    /// Decode period. A zero interval falls back to [`DEFAULT_INTERVAL_MS`].
    pub fn interval(&self) -> Duration {
        period_or_default(Duration::from_millis(self.interval_ms))
    }
}

pub(crate) fn period_or_default(period: Duration) -> Duration {
    if period.is_zero() {
        Duration::from_millis(DEFAULT_INTERVAL_MS)
    } else {
        period
    }
}

pub type InitializedFn = dyn Fn(Arc<dyn CaptureDevice>, Arc<dyn DecodeEngine>) + Send + Sync;
pub type ScannedFn = dyn Fn(Vec<Symbol>) + Send + Sync;
pub type PlayedFn = dyn Fn(PlaybackInfo) + Send + Sync;
pub type ClosedFn = dyn Fn() + Send + Sync;

/// Host notification hooks. All optional.
///
/// Hooks run on the runtime's worker threads, inline with the controller's
/// own bookkeeping, so they should return quickly.
#[derive(Default)]
pub struct ScanCallbacks {
    pub on_initialized: Option<Box<InitializedFn>>,
    pub on_scanned: Option<Box<ScannedFn>>,
    pub on_played: Option<Box<PlayedFn>>,
    pub on_closed: Option<Box<ClosedFn>>,
}

impl fmt::Debug for ScanCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCallbacks")
            .field("on_initialized", &self.on_initialized.is_some())
            .field("on_scanned", &self.on_scanned.is_some())
            .field("on_played", &self.on_played.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}
