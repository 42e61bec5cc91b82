use anyhow::Result;
use image::RgbImage;

use crate::detect::result::{DetectionBox, Recognition};
use crate::frame::Frame;

/// Plate localisation boundary.
///
/// Called synchronously from the orchestrator loop, so pipeline throughput is
/// bounded by its latency. Errors are logged per frame and never stop the loop.
pub trait PlateDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate plates in `frame`, in frame pixel coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>>;

    /// Called once when the orchestrator is built. Failures are logged only.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Character-recognition boundary over a cropped plate region.
pub trait PlateRecognizer: Send {
    fn name(&self) -> &'static str;

    fn recognize(&mut self, plate: &RgbImage) -> Result<Recognition>;
}
