//! Camera scan controller.
//!
//! A [`ScanController`] owns one capture device and one decode engine, opens
//! and closes the camera on the host's request, and once frames are flowing
//! runs a fixed-rate decode loop that never has more than one decode call
//! outstanding. Results go to the host through [`ScanCallbacks`].

mod backend;
#[cfg(feature = "camera")]
mod camera;
mod codec;
mod config;
mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod scan_loop;
mod state;
mod video;

pub use backend::ScanBackend;
#[cfg(all(feature = "camera", feature = "qr"))]
pub use backend::NativeBackend;
#[cfg(feature = "camera")]
pub use camera::NativeCamera;
#[cfg(feature = "qr")]
pub use codec::QrDecoder;
pub use codec::{DecodeEngine, DecoderSetup, Symbol, SymbolFormat};
pub use config::{ScanCallbacks, ScannerSettings, DEFAULT_INTERVAL_MS};
pub use error::{DecodeError, DeviceError, InitError, ScanError, ScanResult};
pub use state::Phase;
pub use video::{
    CaptureDevice, DeviceEvent, Frame, PixelFormat, PlaybackInfo, RenderTarget, VideoFit, DEVICE_EVENT_CAPACITY,
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::scan_loop::LoopHandle;
use crate::state::{ControllerState, Trigger};

type Collaborators = (Arc<dyn CaptureDevice>, Arc<dyn DecodeEngine>);

/// State shared between the controller handle and its background tasks.
pub(crate) struct Inner {
    backend: Arc<dyn ScanBackend>,
    pub(crate) settings: ScannerSettings,
    render_target: Option<RenderTarget>,
    callbacks: ScanCallbacks,
    state: Mutex<ControllerState>,
    /// Mirrors `Phase::Disposed` without the state lock, for callback sites.
    disposed: AtomicBool,
    /// Set while a decode call is outstanding.
    pub(crate) decoding: AtomicBool,
    /// Serializes open/close requests issued by activation changes.
    device_ops: tokio::sync::Mutex<()>,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, ControllerState> {
        // Nothing in the state can be left half-updated by a panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host callbacks, or `None` once disposed.
    ///
    /// Checked right before every callback. A `dispose()` on another thread
    /// can still land between this check and the call itself, so at most one
    /// callback per site may run concurrently with disposal.
    pub(crate) fn callbacks(&self) -> Option<&ScanCallbacks> {
        (!self.disposed.load(Ordering::Acquire)).then_some(&self.callbacks)
    }

    pub(crate) fn report_scanned(&self, symbols: Vec<Symbol>) {
        if let Some(on_scanned) = self.callbacks().and_then(|cb| cb.on_scanned.as_ref()) {
            on_scanned(symbols);
        }
    }
}

/// (Re)start the decode loop. Only meaningful while streaming. A zero
/// period means the default one.
pub(crate) fn start_scanning(inner: &Arc<Inner>, period: Duration) {
    let period = config::period_or_default(period);
    let mut state = inner.state();
    if state.phase != Phase::Streaming {
        tracing::debug!("Not starting scan loop in phase {:?}", state.phase);
        return;
    }
    let (Some(device), Some(decoder), Some(runtime)) =
        (state.device.clone(), state.decoder.clone(), state.runtime.clone())
    else {
        return;
    };
    if state.stop_loop() {
        tracing::debug!("Replacing running scan loop");
    }
    state.scan_loop = Some(LoopHandle::spawn(&runtime, Arc::clone(inner), device, decoder, period));
    tracing::debug!("Scan loop started every {:?}", period);
}

/// Embeddable camera scanner.
///
/// Create one per mounted widget with [`ScanController::builder`], call
/// [`initialize`](Self::initialize) once, then drive the camera with
/// [`set_activation`](Self::set_activation). Dropping the controller disposes
/// it.
///
/// Must be initialized from within a tokio runtime; background tasks are
/// spawned on that runtime.
pub struct ScanController {
    inner: Arc<Inner>,
}

impl ScanController {
    /// Start configuring a controller that gets its collaborators from
    /// `backend`.
    pub fn builder(backend: Arc<dyn ScanBackend>) -> ScanControllerBuilder {
        ScanControllerBuilder {
            backend,
            settings: ScannerSettings::default(),
            render_target: None,
            callbacks: ScanCallbacks::default(),
        }
    }

    /// Acquire the decode engine and capture device, bind the device to the
    /// render target and start listening for device events.
    ///
    /// Only the first call does anything; later calls return `Ok(())`. On
    /// failure the controller stays uninitialized and a later call retries.
    /// An activation requested before this completes is applied at the end.
    pub async fn initialize(&self) -> ScanResult<()> {
        {
            let mut state = self.inner.state();
            let phase = state.phase;
            match phase {
                Phase::Disposed => return Err(ScanError::Disposed),
                Phase::Uninit => {
                    state.apply(Trigger::InitStarted);
                }
                _ => return Ok(()),
            }
        }
        tracing::info!("Initializing scanner");

        let (device, decoder) = match self.acquire().await {
            Ok(collaborators) => collaborators,
            Err(e) => {
                let mut state = self.inner.state();
                if state.phase == Phase::Disposed {
                    return Err(ScanError::Disposed);
                }
                state.apply(Trigger::InitFailed);
                tracing::warn!("Scanner initialization failed: {}", e);
                return Err(e.into());
            }
        };

        let events = device.subscribe();
        let cancel = CancellationToken::new();
        let (disposed, intent) = {
            let mut state = self.inner.state();
            if state.phase == Phase::Disposed {
                (true, false)
            } else {
                state.device = Some(Arc::clone(&device));
                state.decoder = Some(Arc::clone(&decoder));
                state.events = Some(cancel.clone());
                state.runtime = Some(Handle::current());
                state.apply(Trigger::InitSucceeded);
                (false, state.intent)
            }
        };
        if disposed {
            tracing::debug!("Scanner disposed during initialization, releasing collaborators");
            if let Err(e) = device.close().await {
                tracing::debug!("Closing abandoned device failed: {}", e);
            }
            return Err(ScanError::Disposed);
        }

        tracing::info!("Scanner initialized with {} / {}", device.label(), decoder.name());
        if let Some(on_initialized) = self.inner.callbacks().and_then(|cb| cb.on_initialized.as_ref()) {
            on_initialized(Arc::clone(&device), Arc::clone(&decoder));
        }
        tokio::spawn(state::run_event_loop(Arc::clone(&self.inner), events, cancel));

        if intent {
            self.reconcile(true, false).await;
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<Collaborators, InitError> {
        let inner = &self.inner;
        let setup = DecoderSetup {
            license: inner.settings.license.clone(),
        };
        let decoder = inner.backend.create_decoder(&setup).await.map_err(InitError::Decoder)?;
        let device = inner.backend.create_device().await.map_err(InitError::Device)?;
        if let Some(target) = &inner.render_target {
            device.bind(target).await.map_err(|source| InitError::Bind {
                target: target.id.clone(),
                source,
            })?;
        }
        device.set_video_fit(inner.settings.video_fit);
        Ok((device, decoder))
    }

    /// Set the desired camera state.
    ///
    /// Level-triggered: asking for the state the camera is already in (or
    /// heading to) does nothing. Deactivation cancels the scan loop before
    /// this call yields. Before initialization completes the intent is only
    /// recorded. Device failures are logged, not returned.
    pub async fn set_activation(&self, intent: bool) -> ScanResult<()> {
        let loop_stopped = {
            let mut state = self.inner.state();
            if state.phase == Phase::Disposed {
                return Err(ScanError::Disposed);
            }
            state.intent = intent;
            let stopped = !intent && state.stop_loop();
            if !state.phase.is_initialized() {
                tracing::debug!("Scanner not initialized, activation {} deferred", intent);
                return Ok(());
            }
            stopped
        };
        self.reconcile(intent, loop_stopped).await;
        Ok(())
    }

    async fn reconcile(&self, intent: bool, loop_stopped: bool) {
        let _ops = self.inner.device_ops.lock().await;
        if intent {
            self.open_device().await;
        } else {
            self.close_device(loop_stopped).await;
        }
    }

    async fn open_device(&self) {
        let device = {
            let mut state = self.inner.state();
            // A later call changed its mind while we queued; it will act.
            if !state.intent || state.phase.is_open() {
                return;
            }
            let Some(device) = state.device.clone() else {
                return;
            };
            if !state.apply(Trigger::OpenRequested) {
                return;
            }
            device
        };
        tracing::info!("Opening camera {}", device.label());
        if let Err(e) = device.open().await {
            tracing::warn!("Failed to open camera {}: {}", device.label(), e);
            self.inner.state().apply(Trigger::OpenFailed);
        }
    }

    async fn close_device(&self, loop_stopped: bool) {
        let device = {
            let mut state = self.inner.state();
            if state.intent {
                return;
            }
            // A `Played` may have restarted the loop while we queued.
            let stopped = state.stop_loop() || loop_stopped;
            if !state.phase.is_open() && !stopped {
                return;
            }
            state.apply(Trigger::CloseRequested);
            let Some(device) = state.device.clone() else {
                return;
            };
            device
        };
        tracing::info!("Closing camera {}", device.label());
        if let Err(e) = device.close().await {
            tracing::warn!("Failed to close camera {}: {}", device.label(), e);
        }
        self.inner.state().apply(Trigger::Closed);
    }

    /// Restart the decode loop at `period`. Ignored unless streaming. A zero
    /// period selects [`DEFAULT_INTERVAL_MS`].
    pub fn start_scanning(&self, period: Duration) {
        start_scanning(&self.inner, period);
    }

    /// Cancel the decode loop. An in-flight decode is allowed to finish and
    /// may still report once.
    pub fn stop_scanning(&self) {
        if self.inner.state().stop_loop() {
            tracing::debug!("Scan loop stopped");
        }
    }

    /// Release everything: cancel the loop and the event pump, close the
    /// device in the background and drop both collaborators. Idempotent, and
    /// safe before or during initialization. No callbacks fire afterwards.
    pub fn dispose(&self) {
        let (device, runtime) = {
            let mut state = self.inner.state();
            if !state.apply(Trigger::Dispose) {
                return;
            }
            self.inner.disposed.store(true, Ordering::Release);
            state.stop_loop();
            if let Some(events) = state.events.take() {
                events.cancel();
            }
            state.decoder = None;
            (state.device.take(), state.runtime.take())
        };
        if let (Some(device), Some(runtime)) = (device, runtime) {
            runtime.spawn(async move {
                if let Err(e) = device.close().await {
                    tracing::debug!("Closing {} on dispose failed: {}", device.label(), e);
                }
            });
        }
        tracing::info!("Scanner disposed");
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    /// Whether collaborators are acquired and the controller is not disposed.
    pub fn is_initialized(&self) -> bool {
        self.phase().is_initialized()
    }

    /// The host's last requested activation state.
    pub fn intent(&self) -> bool {
        self.inner.state().intent
    }

    /// Whether a decode loop is scheduled.
    pub fn is_scanning(&self) -> bool {
        self.inner.state().scan_loop.is_some()
    }

    /// Whether a decode call is outstanding.
    pub fn is_decoding(&self) -> bool {
        self.inner.decoding.load(Ordering::Acquire)
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("phase", &self.phase())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ScanController`].
pub struct ScanControllerBuilder {
    backend: Arc<dyn ScanBackend>,
    settings: ScannerSettings,
    render_target: Option<RenderTarget>,
    callbacks: ScanCallbacks,
}

impl ScanControllerBuilder {
    /// Replace all plain settings at once, e.g. from a config file.
    pub fn settings(mut self, settings: ScannerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Activation intent applied as soon as initialization completes.
    pub fn active(mut self, active: bool) -> Self {
        self.settings.active = active;
        self
    }

    /// Decode period, at millisecond resolution. Zero selects
    /// [`DEFAULT_INTERVAL_MS`].
    pub fn interval(mut self, interval: Duration) -> Self {
        self.settings.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Credential passed to the decode engine's setup.
    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.settings.license = Some(license.into());
        self
    }

    /// How the preview fills its render target.
    pub fn video_fit(mut self, fit: VideoFit) -> Self {
        self.settings.video_fit = fit;
        self
    }

    /// Surface the device is bound to during initialization. Without one
    /// the device is never bound.
    pub fn render_target(mut self, target: RenderTarget) -> Self {
        self.render_target = Some(target);
        self
    }

    /// Replace all callbacks at once.
    pub fn callbacks(mut self, callbacks: ScanCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Called once after a successful [`ScanController::initialize`], with
    /// the acquired collaborators.
    pub fn on_initialized(
        mut self,
        f: impl Fn(Arc<dyn CaptureDevice>, Arc<dyn DecodeEngine>) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_initialized = Some(Box::new(f));
        self
    }

    /// Called after every completed decode cycle, with no symbols when
    /// nothing was found or the cycle failed.
    pub fn on_scanned(mut self, f: impl Fn(Vec<Symbol>) + Send + Sync + 'static) -> Self {
        self.callbacks.on_scanned = Some(Box::new(f));
        self
    }

    /// Called when the camera starts delivering frames.
    pub fn on_played(mut self, f: impl Fn(PlaybackInfo) + Send + Sync + 'static) -> Self {
        self.callbacks.on_played = Some(Box::new(f));
        self
    }

    /// Called when the camera stream stops, requested or not.
    pub fn on_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_closed = Some(Box::new(f));
        self
    }

    /// Finish configuration. Nothing is acquired until
    /// [`ScanController::initialize`].
    pub fn build(self) -> ScanController {
        let intent = self.settings.active;
        ScanController {
            inner: Arc::new(Inner {
                backend: self.backend,
                settings: self.settings,
                render_target: self.render_target,
                callbacks: self.callbacks,
                state: Mutex::new(ControllerState::new(intent)),
                disposed: AtomicBool::new(false),
                decoding: AtomicBool::new(false),
                device_ops: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockDevice};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, sleep_until, Instant};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        scans: Mutex<Vec<Vec<Symbol>>>,
    }

    impl Recorder {
        fn push(&self, event: &'static str) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        fn scans(&self) -> Vec<Vec<Symbol>> {
            self.scans.lock().unwrap().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.events().iter().filter(|e| **e == event).count()
        }
    }

    fn recorded(builder: ScanControllerBuilder, rec: &Arc<Recorder>) -> ScanController {
        let (r1, r2, r3, r4) = (rec.clone(), rec.clone(), rec.clone(), rec.clone());
        builder
            .on_initialized(move |_, _| r1.push("initialized"))
            .on_scanned(move |symbols| {
                r2.push("scanned");
                r2.scans.lock().unwrap().push(symbols);
            })
            .on_played(move |_| r3.push("played"))
            .on_closed(move || r4.push("closed"))
            .build()
    }

    fn setup() -> (Arc<MockBackend>, Arc<Recorder>, ScanController) {
        let backend = Arc::new(MockBackend::new());
        let rec = Arc::new(Recorder::default());
        let scanner = recorded(ScanController::builder(backend.clone()), &rec);
        (backend, rec, scanner)
    }

    /// Let spawned tasks run without moving the clock.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn streaming() -> (Arc<MockBackend>, Arc<Recorder>, ScanController, Instant) {
        let (backend, rec, scanner) = setup();
        let start = Instant::now();
        scanner.initialize().await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;
        assert_eq!(scanner.phase(), Phase::Streaming);
        (backend, rec, scanner, start)
    }

    #[tokio::test(start_paused = true)]
    async fn first_decode_within_one_interval() {
        let (backend, rec, scanner, start) = streaming().await;
        assert!(scanner.is_scanning());

        sleep_until(start + ms(39)).await;
        assert_eq!(backend.decoder.calls(), 0);

        sleep_until(start + ms(41)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);
        assert_eq!(backend.device.frame_calls(), 1);
        assert_eq!(rec.scans(), vec![Vec::<Symbol>::new()]);
        assert!(!scanner.is_decoding());
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_in_order() {
        let (_backend, rec, _scanner, start) = streaming().await;
        sleep_until(start + ms(81)).await;
        settle().await;
        assert_eq!(rec.events(), vec!["initialized", "played", "scanned", "scanned"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_decode_skips_ticks() {
        let (backend, rec, scanner, start) = streaming().await;
        backend.decoder.set_delay(ms(115));

        // Decode runs 40..155; ticks at 80 and 120 find it in flight.
        sleep_until(start + ms(100)).await;
        assert!(scanner.is_decoding());
        assert_eq!(backend.decoder.calls(), 1);

        sleep_until(start + ms(159)).await;
        assert_eq!(backend.decoder.calls(), 1);
        assert!(!scanner.is_decoding());
        assert_eq!(rec.scans().len(), 1);

        sleep_until(start + ms(161)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 2);

        sleep_until(start + ms(390)).await;
        assert_eq!(backend.decoder.calls(), 3);
        assert_eq!(rec.scans().len(), 2);
        assert_eq!(backend.decoder.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_one_decode_outstanding() {
        let (backend, _rec, _scanner, _start) = streaming().await;
        backend.decoder.set_delay(ms(97));
        sleep(ms(2_000)).await;
        assert!(backend.decoder.calls() > 10);
        assert_eq!(backend.decoder.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decoded_symbols_reach_host() {
        let (backend, rec, _scanner, start) = streaming().await;
        backend
            .decoder
            .push_result(Ok(vec![Symbol::text(SymbolFormat::QrCode, "hello")]));

        sleep_until(start + ms(41)).await;
        settle().await;
        let scans = rec.scans();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0][0].text, "hello");
        assert_eq!(&scans[0][0].raw[..], b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn decode_failure_keeps_loop_alive() {
        let (backend, rec, scanner, start) = streaming().await;
        backend.decoder.push_result(Err(DecodeError::Engine("bad frame".into())));

        sleep_until(start + ms(81)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 2);
        assert_eq!(rec.scans(), vec![Vec::<Symbol>::new(), Vec::new()]);
        assert!(scanner.is_scanning());
        assert!(!scanner.is_decoding());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_stops_polling() {
        let (backend, rec, scanner, start) = streaming().await;
        sleep_until(start + ms(41)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);

        scanner.set_activation(false).await.unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.phase(), Phase::Ready);
        assert_eq!(backend.device.close_calls(), 1);

        sleep_until(start + ms(400)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);
        assert_eq!(rec.count("closed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_mid_decode_drains_once() {
        let (backend, rec, scanner, start) = streaming().await;
        backend.decoder.set_delay(ms(100));

        sleep_until(start + ms(60)).await;
        assert!(scanner.is_decoding());
        scanner.set_activation(false).await.unwrap();
        assert!(!scanner.is_scanning());

        sleep_until(start + ms(141)).await;
        settle().await;
        assert!(!scanner.is_decoding());
        assert_eq!(rec.scans().len(), 1);

        sleep_until(start + ms(500)).await;
        assert_eq!(backend.decoder.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_is_level_triggered() {
        let (backend, _rec, scanner) = setup();
        scanner.initialize().await.unwrap();

        scanner.set_activation(true).await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;
        scanner.set_activation(true).await.unwrap();
        assert_eq!(backend.device.open_calls(), 1);

        scanner.set_activation(false).await.unwrap();
        scanner.set_activation(false).await.unwrap();
        assert_eq!(backend.device.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_activations_open_once() {
        let (backend, _rec, scanner) = setup();
        scanner.initialize().await.unwrap();
        let (a, b) = tokio::join!(scanner.set_activation(true), scanner.set_activation(true));
        a.unwrap();
        b.unwrap();
        assert_eq!(backend.device.open_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_waits_for_played() {
        let backend = Arc::new(MockBackend::with_device(MockDevice::new("slow-cam").manual_play()));
        let rec = Arc::new(Recorder::default());
        let scanner = recorded(ScanController::builder(backend.clone()), &rec);
        scanner.initialize().await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;
        assert_eq!(scanner.phase(), Phase::Opening);
        assert!(!scanner.is_scanning());

        sleep(ms(200)).await;
        assert_eq!(backend.decoder.calls(), 0);

        backend.device.play();
        settle().await;
        assert_eq!(scanner.phase(), Phase::Streaming);
        assert!(scanner.is_scanning());
        assert_eq!(rec.count("played"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_initialize_is_a_noop() {
        let (backend, rec, scanner) = setup();
        backend.set_create_delay(ms(10));
        let (a, b) = tokio::join!(scanner.initialize(), scanner.initialize());
        a.unwrap();
        b.unwrap();
        scanner.initialize().await.unwrap();

        assert_eq!(backend.devices_created(), 1);
        assert_eq!(backend.decoders_created(), 1);
        assert_eq!(rec.count("initialized"), 1);
        assert!(scanner.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initialize_leaves_scanner_inert() {
        let (backend, rec, scanner) = setup();
        backend.fail_next_device(DeviceError::PermissionDenied);

        let err = scanner.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            ScanError::Initialization(InitError::Device(DeviceError::PermissionDenied))
        ));
        assert_eq!(scanner.phase(), Phase::Uninit);
        assert!(rec.events().is_empty());

        scanner.set_activation(true).await.unwrap();
        assert_eq!(backend.device.open_calls(), 0);

        // The host retries explicitly; the recorded intent is applied then.
        scanner.initialize().await.unwrap();
        settle().await;
        assert_eq!(backend.devices_created(), 1);
        assert_eq!(backend.device.open_calls(), 1);
        assert_eq!(scanner.phase(), Phase::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn decoder_load_failure_is_reported() {
        let (backend, _rec, scanner) = setup();
        backend.fail_next_decoder(DecodeError::Load("wasm missing".into()));
        let err = scanner.initialize().await.unwrap_err();
        assert!(matches!(err, ScanError::Initialization(InitError::Decoder(_))));
        assert_eq!(backend.devices_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bind_failure_names_target() {
        let backend = Arc::new(MockBackend::new());
        backend.device.fail_bind(true);
        let scanner = ScanController::builder(backend.clone())
            .render_target(RenderTarget::new("preview", 640, 480))
            .build();
        match scanner.initialize().await {
            Err(ScanError::Initialization(InitError::Bind { target, .. })) => assert_eq!(target, "preview"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!scanner.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn setup_passes_settings_to_collaborators() {
        let backend = Arc::new(MockBackend::new());
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();
        let scanner = ScanController::builder(backend.clone())
            .license("trial-key")
            .render_target(RenderTarget::new("preview", 640, 480))
            .on_initialized(move |device, decoder| {
                *seen_cb.lock().unwrap() = Some((device.label().to_string(), decoder.name().to_string()));
            })
            .build();
        scanner.initialize().await.unwrap();

        assert_eq!(backend.setups()[0].license.as_deref(), Some("trial-key"));
        assert_eq!(backend.device.bound_target().unwrap().id, "preview");
        assert_eq!(backend.device.video_fit(), Some(VideoFit::Cover));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(("mock-camera".to_string(), "mock".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn early_activation_applies_after_init() {
        let (backend, _rec, scanner) = setup();
        scanner.set_activation(true).await.unwrap();
        assert_eq!(backend.device.open_calls(), 0);
        assert!(scanner.intent());

        scanner.initialize().await.unwrap();
        settle().await;
        assert_eq!(backend.device.open_calls(), 1);
        assert_eq!(scanner.phase(), Phase::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn active_setting_opens_on_init() {
        let backend = Arc::new(MockBackend::new());
        let settings: ScannerSettings = serde_json::from_str(r#"{"active": true, "interval_ms": 20}"#).unwrap();
        let scanner = ScanController::builder(backend.clone()).settings(settings).build();
        let start = Instant::now();
        scanner.initialize().await.unwrap();
        settle().await;

        sleep_until(start + ms(41)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_uses_default_period() {
        let backend = Arc::new(MockBackend::new());
        let scanner = ScanController::builder(backend.clone()).interval(Duration::ZERO).build();
        let start = Instant::now();
        scanner.initialize().await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;

        sleep_until(start + ms(41)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);

        scanner.start_scanning(Duration::ZERO);
        assert!(scanner.is_scanning());
        sleep_until(start + ms(79)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);
        sleep_until(start + ms(83)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_releases_decode_guard() {
        let backend = Arc::new(MockBackend::new());
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        let scanner = ScanController::builder(backend.clone())
            .on_scanned(move |_| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("host callback blew up");
                }
            })
            .build();
        let start = Instant::now();
        scanner.initialize().await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;

        sleep_until(start + ms(41)).await;
        settle().await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(!scanner.is_decoding());
        assert!(scanner.is_scanning());

        sleep_until(start + ms(81)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 2);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_are_gated_once_disposed() {
        let (_backend, rec, scanner, _start) = streaming().await;
        assert!(scanner.inner.callbacks().is_some());

        scanner.dispose();
        assert!(scanner.inner.callbacks().is_none());
        // A decode cycle that got past its own checks before the dispose.
        scanner.inner.report_scanned(vec![Symbol::text(SymbolFormat::QrCode, "late")]);
        assert!(rec.scans().is_empty());
        assert_eq!(rec.events(), vec!["initialized", "played"]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_falls_back_to_ready() {
        let (backend, _rec, scanner) = setup();
        backend.device.fail_open(true);
        scanner.initialize().await.unwrap();
        scanner.set_activation(true).await.unwrap();
        settle().await;
        assert_eq!(scanner.phase(), Phase::Ready);
        assert!(!scanner.is_scanning());

        // Still wanted on; retrying needs the device to cooperate.
        backend.device.fail_open(false);
        scanner.set_activation(true).await.unwrap();
        settle().await;
        assert_eq!(scanner.phase(), Phase::Streaming);
        assert_eq!(backend.device.open_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn external_close_is_forwarded_without_reopen() {
        let (backend, rec, scanner, _start) = streaming().await;
        backend.device.disconnect();
        settle().await;

        assert_eq!(rec.count("closed"), 1);
        assert_eq!(scanner.phase(), Phase::Ready);
        assert_eq!(backend.device.open_calls(), 1);
        // Loop survives until the host deactivates.
        assert!(scanner.is_scanning());

        scanner.set_activation(false).await.unwrap();
        assert!(!scanner.is_scanning());
        assert_eq!(backend.device.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_after_device_loss() {
        let (backend, rec, scanner, _start) = streaming().await;
        backend.device.disconnect();
        settle().await;

        scanner.set_activation(true).await.unwrap();
        settle().await;
        assert_eq!(backend.device.open_calls(), 2);
        assert_eq!(scanner.phase(), Phase::Streaming);
        assert_eq!(rec.count("played"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_schedule() {
        let (backend, _rec, scanner, start) = streaming().await;
        scanner.start_scanning(ms(10));
        sleep_until(start + ms(35)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 3);

        scanner.stop_scanning();
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.phase(), Phase::Streaming);
        sleep_until(start + ms(200)).await;
        assert_eq!(backend.decoder.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn start_scanning_ignored_unless_streaming() {
        let (_backend, _rec, scanner) = setup();
        scanner.start_scanning(ms(10));
        assert!(!scanner.is_scanning());
        scanner.initialize().await.unwrap();
        scanner.start_scanning(ms(10));
        assert!(!scanner.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_init_is_safe() {
        let (backend, rec, scanner) = setup();
        scanner.dispose();
        scanner.dispose();
        assert_eq!(scanner.phase(), Phase::Disposed);

        assert!(matches!(scanner.initialize().await, Err(ScanError::Disposed)));
        assert!(matches!(scanner.set_activation(true).await, Err(ScanError::Disposed)));
        assert_eq!(backend.devices_created(), 0);
        assert!(rec.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_during_init_releases_collaborators() {
        let (backend, rec, scanner) = setup();
        backend.set_create_delay(ms(50));
        let (result, ()) = tokio::join!(scanner.initialize(), async {
            sleep(ms(20)).await;
            scanner.dispose();
        });
        assert!(matches!(result, Err(ScanError::Disposed)));
        assert_eq!(backend.device.close_calls(), 1);
        assert!(rec.events().is_empty());

        let state = scanner.inner.state();
        assert!(state.device.is_none());
        assert!(state.decoder.is_none());
        assert!(state.scan_loop.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_while_streaming_silences_everything() {
        let (backend, rec, scanner, start) = streaming().await;
        backend.decoder.set_delay(ms(100));

        sleep_until(start + ms(60)).await;
        assert!(scanner.is_decoding());
        scanner.dispose();
        scanner.dispose();
        settle().await;

        assert_eq!(backend.device.close_calls(), 1);
        {
            let state = scanner.inner.state();
            assert!(state.device.is_none());
            assert!(state.decoder.is_none());
            assert!(state.scan_loop.is_none());
            assert!(state.events.is_none());
        }

        sleep_until(start + ms(500)).await;
        settle().await;
        assert_eq!(backend.decoder.calls(), 1);
        assert!(rec.scans().is_empty());
        assert_eq!(rec.count("closed"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_disposes() {
        let (backend, _rec, scanner, _start) = streaming().await;
        drop(scanner);
        settle().await;
        assert_eq!(backend.device.close_calls(), 1);
        assert!(!backend.device.is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn controllers_are_independent() {
        let (slow_backend, _, _slow, start) = streaming().await;
        slow_backend.decoder.set_delay(ms(1_000));
        let (fast_backend, _, _fast, _) = streaming().await;

        sleep_until(start + ms(201)).await;
        settle().await;
        assert_eq!(slow_backend.decoder.calls(), 1);
        assert_eq!(fast_backend.decoder.calls(), 5);
    }
}
