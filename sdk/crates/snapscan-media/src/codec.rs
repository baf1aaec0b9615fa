//! Decode engine abstraction and the bundled QR engine.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DecodeError;
use crate::video::Frame;

/// Symbology of a recognized symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolFormat {
    QrCode,
    DataMatrix,
    Ean13,
    Code128,
    Other(String),
}

/// One recognized barcode/QR symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub format: SymbolFormat,
    pub text: String,
    pub raw: Bytes,
    /// Corner points in frame coordinates, clockwise from top-left, when the
    /// engine reports them.
    pub corners: Option<[(i32, i32); 4]>,
}

impl Symbol {
    /// A symbol whose payload is `text`, with no corner points.
    pub fn text(format: SymbolFormat, text: impl Into<String>) -> Self {
        let text = text.into();
        Symbol {
            format,
            raw: Bytes::from(text.clone().into_bytes()),
            text,
            corners: None,
        }
    }
}

/// Setup parameters handed to the backend when it creates a decode engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderSetup {
    /// Activation credential, passed through untouched.
    pub license: Option<String>,
}

/// Symbol-recognition backend.
///
/// A call may take much longer than a frame interval. The controller
/// guarantees it never has two `decode` calls outstanding on the same engine.
#[async_trait]
pub trait DecodeEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize every symbol in `frame`. No symbols is `Ok(vec![])`.
    async fn decode(&self, frame: &Frame) -> Result<Vec<Symbol>, DecodeError>;
}

/// QR-only decode engine backed by `rqrr`.
///
/// Detection is CPU-bound, so each call runs on the blocking pool.
#[cfg(feature = "qr")]
#[derive(Debug, Default)]
pub struct QrDecoder;

#[cfg(feature = "qr")]
impl QrDecoder {
    pub fn new() -> Self {
        QrDecoder
    }
}

#[cfg(feature = "qr")]
#[async_trait]
impl DecodeEngine for QrDecoder {
    fn name(&self) -> &str {
        "rqrr"
    }

    async fn decode(&self, frame: &Frame) -> Result<Vec<Symbol>, DecodeError> {
        // Frame data is refcounted, the clone is shallow.
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || decode_qr(&frame))
            .await
            .map_err(|e| DecodeError::Engine(format!("decode task failed: {}", e)))?
    }
}

#[cfg(feature = "qr")]
fn decode_qr(frame: &Frame) -> Result<Vec<Symbol>, DecodeError> {
    let luma = frame.to_luma().ok_or_else(|| {
        DecodeError::UnsupportedFrame(format!(
            "{}x{} {:?} frame carries {} bytes",
            frame.width,
            frame.height,
            frame.format,
            frame.data.len()
        ))
    })?;
    let (w, h) = (frame.width as usize, frame.height as usize);
    if w == 0 || h == 0 {
        return Ok(Vec::new());
    }

    let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| luma[y * w + x]);
    let mut symbols = Vec::new();
    for grid in prepared.detect_grids() {
        match grid.decode() {
            Ok((_meta, text)) => {
                let b = &grid.bounds;
                let mut symbol = Symbol::text(SymbolFormat::QrCode, text);
                symbol.corners = Some([
                    (b[0].x, b[0].y),
                    (b[1].x, b[1].y),
                    (b[2].x, b[2].y),
                    (b[3].x, b[3].y),
                ]);
                symbols.push(symbol);
            }
            Err(e) => tracing::debug!("QR grid located but not decodable: {}", e),
        }
    }
    Ok(symbols)
}
