//! Scan QR codes from the first webcam and log what is found.
//!
//! Usage: cargo run -p snapscan-media --example scan_camera --features camera,qr

use std::sync::Arc;
use std::time::Duration;

use snapscan_media::{NativeBackend, RenderTarget, ScanController};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let scanner = ScanController::builder(Arc::new(NativeBackend::new(0)))
        .interval(Duration::from_millis(100))
        .render_target(RenderTarget::new("terminal", 640, 480))
        .on_initialized(|device, decoder| {
            tracing::info!("Using {} with the {} decoder", device.label(), decoder.name());
        })
        .on_played(|info| tracing::info!("Streaming {}x{}", info.width, info.height))
        .on_scanned(|symbols| {
            for symbol in symbols {
                tracing::info!("{:?}: {}", symbol.format, symbol.text);
            }
        })
        .on_closed(|| tracing::info!("Camera closed"))
        .build();

    scanner.initialize().await?;
    scanner.set_activation(true).await?;

    tokio::signal::ctrl_c().await?;
    scanner.set_activation(false).await?;
    scanner.dispose();
    Ok(())
}
