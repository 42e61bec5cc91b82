//! Frame container and the single-slot hand-off buffer.
//!
//! - `Frame`: one decoded RGB image, its capture instant, and the id of the source
//!   that produced it. Frames are consumed by the orchestrator on the cycle they are
//!   fetched and dropped afterwards.
//! - `LatestFrame`: the only structure shared between a capture thread and the
//!   orchestrator. A write replaces any unread frame; a read takes it.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::Mutex;
use std::time::Instant;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB frame.
///
/// Not `Clone`: a frame has exactly one owner at a time, and the orchestrator drops
/// it at the end of the cycle that fetched it.
pub struct Frame {
    image: RgbImage,
    captured_at: Instant,
    source_id: String,
}

impl Frame {
    /// Wrap a decoded image. Zero-sized images are rejected so that an empty decode
    /// surfaces as a read failure instead of a frame.
    pub fn new(image: RgbImage, source_id: &str) -> Result<Self> {
        Self::captured_at(image, source_id, Instant::now())
    }

    pub fn captured_at(image: RgbImage, source_id: &str, captured_at: Instant) -> Result<Self> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("empty frame from {}", source_id));
        }
        Ok(Self {
            image,
            captured_at,
            source_id: source_id.to_string(),
        })
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, source_id: &str) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Self::new(image, source_id)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn captured_instant(&self) -> Instant {
        self.captured_at
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Age of this frame, for staleness logging.
    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

impl std::fmt::Debug for Frame {
    // Pixel content is never printed.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source_id", &self.source_id)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// JPEG-encode an RGB image (detector uploads and plate snapshots).
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .map_err(|e| anyhow!("encode jpeg: {}", e))?;
    Ok(out.into_inner())
}

// ----------------------------------------------------------------------------
// LatestFrame: single-slot overwrite buffer
// ----------------------------------------------------------------------------

/// Single-slot frame buffer shared by one producer and one consumer.
///
/// Invariants:
/// - holds at most one frame, always the most recently written one
/// - a write never blocks behind an unread frame; it replaces it
/// - a read removes the frame, so the same frame is never returned twice
pub struct LatestFrame {
    slot: Mutex<Option<Frame>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Store `frame`, dropping any unread one. Returns true when a frame was dropped.
    pub fn replace(&self, frame: Frame) -> bool {
        let previous = match self.slot.lock() {
            Ok(mut guard) => guard.replace(frame),
            Err(poisoned) => poisoned.into_inner().replace(frame),
        };
        previous.is_some()
    }

    /// Take the latest frame if one is waiting. Never blocks on I/O.
    pub fn take(&self) -> Option<Frame> {
        match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Drop any unread frame (used when a source disconnects).
    pub fn clear(&self) {
        let _ = self.take();
    }

    pub fn is_empty(&self) -> bool {
        match self.slot.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
