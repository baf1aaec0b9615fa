//! In-memory capture device, decode engine and backend for tests.
//!
//! Everything counts its calls so tests can assert on how the controller
//! drove it. Failures and delays are scripted up front.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::backend::ScanBackend;
use crate::codec::{DecodeEngine, DecoderSetup, Symbol};
use crate::error::{DecodeError, DeviceError};
use crate::video::{CaptureDevice, DeviceEvent, Frame, PlaybackInfo, RenderTarget, VideoFit, DEVICE_EVENT_CAPACITY};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fake camera.
///
/// By default `open` immediately emits [`DeviceEvent::Played`], like a
/// camera that starts streaming right away. Use [`manual_play`] to emit it
/// yourself with [`play`](MockDevice::play).
///
/// [`manual_play`]: MockDevice::manual_play
pub struct MockDevice {
    label: String,
    events: broadcast::Sender<DeviceEvent>,
    auto_play: AtomicBool,
    streaming: AtomicBool,
    fail_open: AtomicBool,
    fail_bind: AtomicBool,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    frame_calls: AtomicUsize,
    sequence: AtomicU64,
    fit: Mutex<Option<VideoFit>>,
    bound: Mutex<Option<RenderTarget>>,
}

impl MockDevice {
    pub fn new(label: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(DEVICE_EVENT_CAPACITY);
        MockDevice {
            label: label.into(),
            events,
            auto_play: AtomicBool::new(true),
            streaming: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_bind: AtomicBool::new(false),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            frame_calls: AtomicUsize::new(0),
            sequence: AtomicU64::new(0),
            fit: Mutex::new(None),
            bound: Mutex::new(None),
        }
    }

    /// Don't emit `Played` on open.
    pub fn manual_play(self) -> Self {
        self.auto_play.store(false, Ordering::SeqCst);
        self
    }

    /// Make every `open` fail with `PermissionDenied`.
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make every `bind` fail with `Disconnected`.
    pub fn fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        PlaybackInfo {
            width: 4,
            height: 4,
            device_id: self.label.clone(),
        }
    }

    /// Emit `Played` as if the first frame just arrived.
    pub fn play(&self) {
        self.streaming.store(true, Ordering::SeqCst);
        let _ = self.events.send(DeviceEvent::Played(self.playback_info()));
    }

    /// Simulate the camera going away without being asked to close.
    pub fn disconnect(&self) {
        self.streaming.store(false, Ordering::SeqCst);
        let _ = self.events.send(DeviceEvent::Closed);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn frame_calls(&self) -> usize {
        self.frame_calls.load(Ordering::SeqCst)
    }

    pub fn video_fit(&self) -> Option<VideoFit> {
        *lock(&self.fit)
    }

    pub fn bound_target(&self) -> Option<RenderTarget> {
        lock(&self.bound).clone()
    }
}

#[async_trait]
impl CaptureDevice for MockDevice {
    fn label(&self) -> &str {
        &self.label
    }

    async fn bind(&self, target: &RenderTarget) -> Result<(), DeviceError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected);
        }
        *lock(&self.bound) = Some(target.clone());
        Ok(())
    }

    fn set_video_fit(&self, fit: VideoFit) {
        *lock(&self.fit) = Some(fit);
    }

    async fn open(&self) -> Result<(), DeviceError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        if self.auto_play.load(Ordering::SeqCst) {
            self.play();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.streaming.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(DeviceEvent::Closed);
        }
        Ok(())
    }

    async fn frame(&self) -> Result<Frame, DeviceError> {
        self.frame_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_streaming() {
            return Err(DeviceError::NotStreaming);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Frame::luma(4, 4, vec![0u8; 16], sequence))
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// Fake decode engine with a configurable per-call delay and scripted
/// results. Unscripted calls succeed with no symbols.
pub struct MockDecoder {
    delay: Mutex<Duration>,
    script: Mutex<VecDeque<Result<Vec<Symbol>, DecodeError>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDecoder {
    pub fn new() -> Self {
        MockDecoder {
            delay: Mutex::new(Duration::ZERO),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// How long each decode call takes.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Queue the outcome of the next unscripted call.
    pub fn push_result(&self, result: Result<Vec<Symbol>, DecodeError>) {
        lock(&self.script).push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping decode calls ever observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecodeEngine for MockDecoder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn decode(&self, _frame: &Frame) -> Result<Vec<Symbol>, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.script).pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Hands out one shared [`MockDevice`] and [`MockDecoder`], counting how
/// often it was asked to.
pub struct MockBackend {
    pub device: Arc<MockDevice>,
    pub decoder: Arc<MockDecoder>,
    create_delay: Mutex<Duration>,
    device_failure: Mutex<Option<DeviceError>>,
    decoder_failure: Mutex<Option<DecodeError>>,
    devices_created: AtomicUsize,
    decoders_created: AtomicUsize,
    setups: Mutex<Vec<DecoderSetup>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_device(MockDevice::new("mock-camera"))
    }

    pub fn with_device(device: MockDevice) -> Self {
        MockBackend {
            device: Arc::new(device),
            decoder: Arc::new(MockDecoder::new()),
            create_delay: Mutex::new(Duration::ZERO),
            device_failure: Mutex::new(None),
            decoder_failure: Mutex::new(None),
            devices_created: AtomicUsize::new(0),
            decoders_created: AtomicUsize::new(0),
            setups: Mutex::new(Vec::new()),
        }
    }

    /// Delay applied to each `create_*` call.
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = delay;
    }

    /// Fail the next `create_device` call only.
    pub fn fail_next_device(&self, err: DeviceError) {
        *lock(&self.device_failure) = Some(err);
    }

    /// Fail the next `create_decoder` call only.
    pub fn fail_next_decoder(&self, err: DecodeError) {
        *lock(&self.decoder_failure) = Some(err);
    }

    pub fn devices_created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }

    pub fn decoders_created(&self) -> usize {
        self.decoders_created.load(Ordering::SeqCst)
    }

    /// Every setup passed to `create_decoder`, in order.
    pub fn setups(&self) -> Vec<DecoderSetup> {
        lock(&self.setups).clone()
    }

    async fn pause(&self) {
        let delay = *lock(&self.create_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanBackend for MockBackend {
    async fn create_decoder(&self, setup: &DecoderSetup) -> Result<Arc<dyn DecodeEngine>, DecodeError> {
        self.pause().await;
        lock(&self.setups).push(setup.clone());
        if let Some(err) = lock(&self.decoder_failure).take() {
            return Err(err);
        }
        self.decoders_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.decoder.clone())
    }

    async fn create_device(&self) -> Result<Arc<dyn CaptureDevice>, DeviceError> {
        self.pause().await;
        if let Some(err) = lock(&self.device_failure).take() {
            return Err(err);
        }
        self.devices_created.fetch_add(1, Ordering::SeqCst);
        Ok(self.device.clone())
    }
}
