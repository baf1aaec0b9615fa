//! Native webcam capture device on `nokhwa`.
//!
//! The camera handle is not thread-safe on every platform, so it lives on a
//! dedicated capture thread that serves commands sent from async code.

use async_trait::async_trait;
use nokhwa::pixel_format::LumaFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::DeviceError;
use crate::video::{CaptureDevice, DeviceEvent, Frame, PlaybackInfo, RenderTarget, VideoFit, DEVICE_EVENT_CAPACITY};

/// Failed grabs in a row after which an open stream counts as lost.
const MAX_FRAME_FAILURES: u32 = 5;

enum CameraCommand {
    Open(oneshot::Sender<Result<(), DeviceError>>),
    Close(oneshot::Sender<Result<(), DeviceError>>),
    Frame(oneshot::Sender<Result<Frame, DeviceError>>),
}

/// A local webcam, driven from its own capture thread.
pub struct NativeCamera {
    label: String,
    cmd_tx: mpsc::UnboundedSender<CameraCommand>,
    events: broadcast::Sender<DeviceEvent>,
    fit: Mutex<VideoFit>,
    target: Mutex<Option<RenderTarget>>,
}

impl NativeCamera {
    /// Look up camera `index` and start its capture thread. The camera is
    /// not opened until [`CaptureDevice::open`].
    pub fn spawn(index: u32) -> Result<Self, DeviceError> {
        let devices = nokhwa::query(ApiBackend::Auto).map_err(|e| DeviceError::Capture(e.to_string()))?;
        let info = devices
            .into_iter()
            .find(|info| *info.index() == CameraIndex::Index(index))
            .ok_or_else(|| DeviceError::NotFound(format!("no camera at index {}", index)))?;
        let label = info.human_name();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(DEVICE_EVENT_CAPACITY);
        let worker_events = events.clone();
        let worker_label = label.clone();
        std::thread::Builder::new()
            .name(format!("snapscan-camera-{}", index))
            .spawn(move || capture_thread(index, worker_label, cmd_rx, worker_events))
            .map_err(|e| DeviceError::Capture(format!("failed to start capture thread: {}", e)))?;

        tracing::info!("Camera {} ready: {}", index, label);
        Ok(NativeCamera {
            label,
            cmd_tx,
            events,
            fit: Mutex::new(VideoFit::default()),
            target: Mutex::new(None),
        })
    }

    /// Fit last requested by the controller.
    pub fn video_fit(&self) -> VideoFit {
        *self.fit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Surface the camera was bound to, if any.
    pub fn render_target(&self) -> Option<RenderTarget> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, DeviceError>>) -> CameraCommand,
    ) -> Result<T, DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| DeviceError::Disconnected)?;
        rx.await.map_err(|_| DeviceError::Disconnected)?
    }
}

#[async_trait]
impl CaptureDevice for NativeCamera {
    fn label(&self) -> &str {
        &self.label
    }

    async fn bind(&self, target: &RenderTarget) -> Result<(), DeviceError> {
        tracing::debug!("Camera {} bound to {}", self.label, target.id);
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
        Ok(())
    }

    fn set_video_fit(&self, fit: VideoFit) {
        *self.fit.lock().unwrap_or_else(PoisonError::into_inner) = fit;
    }

    async fn open(&self) -> Result<(), DeviceError> {
        self.request(CameraCommand::Open).await
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.request(CameraCommand::Close).await
    }

    async fn frame(&self) -> Result<Frame, DeviceError> {
        self.request(CameraCommand::Frame).await
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// An open camera that has delivered at least one frame.
struct Stream {
    camera: Camera,
    info: PlaybackInfo,
    failures: FailureStreak,
}

/// Counts consecutive failures; any success resets the run.
#[derive(Debug)]
struct FailureStreak {
    run: u32,
    limit: u32,
}

impl FailureStreak {
    fn new(limit: u32) -> Self {
        FailureStreak { run: 0, limit }
    }

    /// Record one outcome. True once `limit` failures in a row were seen.
    fn record(&mut self, ok: bool) -> bool {
        if ok {
            self.run = 0;
        } else {
            self.run += 1;
        }
        self.run >= self.limit
    }
}

/// Capture thread body. Exits when every command sender is gone.
fn capture_thread(
    index: u32,
    label: String,
    mut cmd_rx: mpsc::UnboundedReceiver<CameraCommand>,
    events: broadcast::Sender<DeviceEvent>,
) {
    let mut stream: Option<Stream> = None;
    let mut sequence = 0u64;

    while let Some(cmd) = cmd_rx.blocking_recv() {
        match cmd {
            CameraCommand::Open(reply) => {
                if let Some(open) = &stream {
                    // Repeat `Played` so a caller waiting for it is not left hanging.
                    let _ = reply.send(Ok(()));
                    let _ = events.send(DeviceEvent::Played(open.info.clone()));
                    continue;
                }
                match start_stream(index, &label, &mut sequence) {
                    Ok(started) => {
                        let _ = reply.send(Ok(()));
                        let _ = events.send(DeviceEvent::Played(started.info.clone()));
                        stream = Some(started);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            CameraCommand::Close(reply) => {
                if let Some(mut open) = stream.take() {
                    stop(&mut open.camera, &label);
                    let _ = events.send(DeviceEvent::Closed);
                }
                let _ = reply.send(Ok(()));
            }
            CameraCommand::Frame(reply) => {
                let Some(open) = stream.as_mut() else {
                    let _ = reply.send(Err(DeviceError::NotStreaming));
                    continue;
                };
                let result = grab(&mut open.camera, &mut sequence);
                if open.failures.record(result.is_ok()) {
                    tracing::warn!("Camera {} lost after {} failed frames", label, MAX_FRAME_FAILURES);
                    if let Some(mut lost) = stream.take() {
                        stop(&mut lost.camera, &label);
                    }
                    let _ = events.send(DeviceEvent::Closed);
                }
                let _ = reply.send(result);
            }
        }
    }

    if let Some(mut open) = stream.take() {
        stop(&mut open.camera, &label);
    }
    tracing::debug!("Camera {} capture thread exiting", label);
}

/// Open the camera and pull the first frame. The stream only counts as
/// playing once a frame makes it through; otherwise it is shut again.
fn start_stream(index: u32, label: &str, sequence: &mut u64) -> Result<Stream, DeviceError> {
    let mut camera = open_camera(index)?;
    match grab(&mut camera, sequence) {
        Ok(frame) => Ok(Stream {
            info: PlaybackInfo {
                width: frame.width,
                height: frame.height,
                device_id: label.to_string(),
            },
            camera,
            failures: FailureStreak::new(MAX_FRAME_FAILURES),
        }),
        Err(e) => {
            tracing::warn!("Camera {} opened but produced no frame: {}", label, e);
            stop(&mut camera, label);
            Err(e)
        }
    }
}

fn stop(camera: &mut Camera, label: &str) {
    if let Err(e) = camera.stop_stream() {
        tracing::debug!("Camera {} stop_stream failed: {}", label, e);
    }
}

fn open_camera(index: u32) -> Result<Camera, DeviceError> {
    let requested = RequestedFormat::new::<LumaFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
    let mut camera =
        Camera::new(CameraIndex::Index(index), requested).map_err(|e| DeviceError::Capture(e.to_string()))?;
    camera
        .open_stream()
        .map_err(|e| DeviceError::Capture(e.to_string()))?;
    Ok(camera)
}

fn grab(camera: &mut Camera, sequence: &mut u64) -> Result<Frame, DeviceError> {
    let buffer = camera.frame().map_err(|e| DeviceError::Capture(e.to_string()))?;
    let image = buffer
        .decode_image::<LumaFormat>()
        .map_err(|e| DeviceError::Capture(e.to_string()))?;
    let (width, height) = (image.width(), image.height());
    *sequence += 1;
    Ok(Frame::luma(width, height, image.into_raw(), *sequence))
}
