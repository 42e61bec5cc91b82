use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::{PlateDetector, PlateRecognizer};
use crate::detect::result::{DetectionBox, Recognition};
use crate::frame::Frame;

/// Stub detector for tests and dry runs. Reports one plate box centred in every
/// frame, a quarter of the frame wide and a tenth high.
pub struct StubDetector {
    confidence: f32,
}

impl StubDetector {
    pub fn new() -> Self {
        Self { confidence: 0.9 }
    }

    pub fn with_confidence(confidence: f32) -> Self {
        Self { confidence }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PlateDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionBox>> {
        let (w, h) = (frame.width() as f32, frame.height() as f32);
        Ok(vec![DetectionBox::new(
            w * 0.375,
            h * 0.45,
            w * 0.625,
            h * 0.55,
            self.confidence,
        )])
    }
}

/// Stub recogniser that reads the scripted plates in order, wrapping around.
/// An empty script always reads nothing.
pub struct StubRecognizer {
    script: Vec<String>,
    next: usize,
}

impl StubRecognizer {
    pub fn new(script: Vec<String>) -> Self {
        Self { script, next: 0 }
    }
}

impl PlateRecognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn recognize(&mut self, _plate: &RgbImage) -> Result<Recognition> {
        if self.script.is_empty() {
            return Ok(Recognition::Text(String::new()));
        }
        let text = self.script[self.next % self.script.len()].clone();
        self.next = self.next.wrapping_add(1);
        Ok(Recognition::Text(text))
    }
}
