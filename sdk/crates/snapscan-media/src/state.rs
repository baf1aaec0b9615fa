//! Scanner lifecycle state machine.
//!
//! Device events and host calls are mapped onto [`Trigger`]s; [`Phase::next`]
//! is the single place that decides which transitions are legal.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::codec::DecodeEngine;
use crate::scan_loop::LoopHandle;
use crate::video::{CaptureDevice, DeviceEvent, PlaybackInfo};
use crate::Inner;

/// Where a controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collaborators not acquired. Also the state after a failed init.
    Uninit,
    Initializing,
    /// Collaborators acquired, camera closed.
    Ready,
    /// Open requested, waiting for the device to report frames.
    Opening,
    /// Frames flowing, scan loop running.
    Streaming,
    Closing,
    /// Terminal.
    Disposed,
}

/// Inputs that drive [`Phase`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    InitStarted,
    InitSucceeded,
    InitFailed,
    OpenRequested,
    OpenFailed,
    Played,
    CloseRequested,
    /// Close confirmed by the device call or by a `Closed` event.
    Closed,
    Dispose,
}

impl Phase {
    /// The phase reached from `self` on `trigger`, or `None` if the trigger
    /// is not meaningful here and should be ignored.
    pub fn next(self, trigger: Trigger) -> Option<Phase> {
        use Phase::*;
        use Trigger::*;

        match (self, trigger) {
            (Disposed, _) => None,
            (_, Dispose) => Some(Disposed),

            (Uninit, InitStarted) => Some(Initializing),
            (Initializing, InitSucceeded) => Some(Ready),
            (Initializing, InitFailed) => Some(Uninit),

            (Ready, OpenRequested) => Some(Opening),
            (Opening, OpenFailed) => Some(Ready),
            (Ready | Opening | Streaming, Played) => Some(Streaming),

            (Opening | Streaming, CloseRequested) => Some(Closing),
            (Opening | Streaming | Closing, Closed) => Some(Ready),

            _ => None,
        }
    }

    /// Whether collaborators are held and usable.
    pub fn is_initialized(self) -> bool {
        !matches!(self, Phase::Uninit | Phase::Initializing | Phase::Disposed)
    }

    /// Whether the camera is open or on its way to being open.
    pub fn is_open(self) -> bool {
        matches!(self, Phase::Opening | Phase::Streaming)
    }
}

/// Mutable controller state. Lives behind the controller's mutex; never
/// held across an `.await`.
pub(crate) struct ControllerState {
    pub phase: Phase,
    /// Desired camera state as last set by the host.
    pub intent: bool,
    pub device: Option<Arc<dyn CaptureDevice>>,
    pub decoder: Option<Arc<dyn DecodeEngine>>,
    pub scan_loop: Option<LoopHandle>,
    /// Stops the device event pump.
    pub events: Option<CancellationToken>,
    /// Runtime captured at init, used for the best-effort close on dispose.
    pub runtime: Option<Handle>,
}

impl ControllerState {
    pub fn new(intent: bool) -> Self {
        ControllerState {
            phase: Phase::Uninit,
            intent,
            device: None,
            decoder: None,
            scan_loop: None,
            events: None,
            runtime: None,
        }
    }

    /// Apply `trigger`. Returns whether the phase changed.
    pub fn apply(&mut self, trigger: Trigger) -> bool {
        match self.phase.next(trigger) {
            Some(next) => {
                if next != self.phase {
                    tracing::debug!("Scanner phase {:?} -> {:?} on {:?}", self.phase, next, trigger);
                }
                self.phase = next;
                true
            }
            None => {
                tracing::trace!("Ignoring {:?} in phase {:?}", trigger, self.phase);
                false
            }
        }
    }

    /// Cancel the scan loop if one is running. Returns whether one was.
    pub fn stop_loop(&mut self) -> bool {
        match self.scan_loop.take() {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }
}

/// Device event pump. Maps `Played`/`Closed` onto phase transitions and
/// host callbacks until cancelled or the device drops its sender.
pub(crate) async fn run_event_loop(
    inner: Arc<Inner>,
    mut events: broadcast::Receiver<DeviceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Device event loop cancelled");
                break;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(DeviceEvent::Played(info)) => on_played(&inner, info),
            Ok(DeviceEvent::Closed) => on_closed(&inner),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Device event loop lagged, {} events dropped", missed);
            }
            Err(RecvError::Closed) => {
                tracing::debug!("Device event channel closed");
                break;
            }
        }
    }
}

fn on_played(inner: &Arc<Inner>, info: PlaybackInfo) {
    if !inner.state().apply(Trigger::Played) {
        return;
    }
    tracing::info!("Camera playing {}x{} on {}", info.width, info.height, info.device_id);
    if let Some(on_played) = inner.callbacks().and_then(|cb| cb.on_played.as_ref()) {
        on_played(info);
    }
    crate::start_scanning(inner, inner.settings.interval());
}

fn on_closed(inner: &Arc<Inner>) {
    {
        let mut state = inner.state();
        if state.phase == Phase::Disposed {
            return;
        }
        // The loop is left alone; deactivation or dispose stops it.
        state.apply(Trigger::Closed);
    }
    tracing::info!("Camera stream closed");
    if let Some(on_closed) = inner.callbacks().and_then(|cb| cb.on_closed.as_ref()) {
        on_closed();
    }
}
