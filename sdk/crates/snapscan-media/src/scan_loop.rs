//! Periodic decode loop with single-flight backpressure.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::{DecodeEngine, Symbol};
use crate::error::{DecodeError, DeviceError};
use crate::video::CaptureDevice;
use crate::Inner;

/// Owned handle of a running scan loop. Dropping it stops the loop.
pub(crate) struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn spawn(
        runtime: &Handle,
        inner: Arc<Inner>,
        device: Arc<dyn CaptureDevice>,
        decoder: Arc<dyn DecodeEngine>,
        period: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run(inner, device, decoder, period, cancel.clone()));
        LoopHandle { cancel, task }
    }

    /// Cancel the schedule. An in-flight decode is left to finish.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Clears the in-flight flag when the decode cycle ends, whichever way it
/// ends.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn acquire(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .decoding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(Arc::clone(inner)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.decoding.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error)]
enum CycleError {
    #[error("frame capture failed: {0}")]
    Capture(#[from] DeviceError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl CycleError {
    /// A camera that stopped streaming under a still-running loop fails
    /// every tick until the host deactivates; not worth a warning each time.
    fn is_routine(&self) -> bool {
        matches!(self, CycleError::Capture(DeviceError::NotStreaming))
    }
}

async fn run(
    inner: Arc<Inner>,
    device: Arc<dyn CaptureDevice>,
    decoder: Arc<dyn DecodeEngine>,
    period: Duration,
    cancel: CancellationToken,
) {
    // First tick one period from now, not immediately.
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(guard) = InFlight::acquire(&inner) else {
            tracing::trace!("Decode still in flight, skipping tick");
            continue;
        };
        tokio::spawn(decode_cycle(
            Arc::clone(&inner),
            Arc::clone(&device),
            Arc::clone(&decoder),
            cancel.clone(),
            guard,
        ));
    }
    tracing::debug!("Scan loop exited");
}

async fn decode_cycle(
    inner: Arc<Inner>,
    device: Arc<dyn CaptureDevice>,
    decoder: Arc<dyn DecodeEngine>,
    cancel: CancellationToken,
    _guard: InFlight,
) {
    // Stopped between the tick and this task's first poll.
    if cancel.is_cancelled() {
        return;
    }
    let symbols = match capture_and_decode(&*device, &*decoder, &cancel).await {
        Ok(Some(symbols)) => symbols,
        Ok(None) => return,
        Err(e) if e.is_routine() => {
            tracing::trace!(decoder = decoder.name(), "Decode cycle skipped: {}", e);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(decoder = decoder.name(), "Decode cycle failed: {}", e);
            Vec::new()
        }
    };
    inner.report_scanned(symbols);
}

async fn capture_and_decode(
    device: &dyn CaptureDevice,
    decoder: &dyn DecodeEngine,
    cancel: &CancellationToken,
) -> Result<Option<Vec<Symbol>>, CycleError> {
    let frame = device.frame().await?;
    if cancel.is_cancelled() {
        return Ok(None);
    }
    let symbols = decoder.decode(&frame).await?;
    tracing::trace!(frame = frame.sequence, found = symbols.len(), "Decode cycle finished");
    Ok(Some(symbols))
}
