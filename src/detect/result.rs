use image::RgbImage;

use crate::frame::Frame;

/// Axis-aligned plate box in source-frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl DetectionBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Pixel rectangle `(x, y, width, height)` clamped to a `width` x `height`
    /// frame. `None` when nothing of the box remains inside the frame.
    pub fn clamped(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.max(0.0).min(max as f32) as u32;
        let (left, right) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (top, bottom) = (self.y1.min(self.y2), self.y1.max(self.y2));
        let x0 = clamp(left, width);
        let y0 = clamp(top, height);
        let x1 = clamp(right, width);
        let y1 = clamp(bottom, height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// Copy the plate region out of `frame`. Empty crops yield `None`.
    pub fn crop(&self, frame: &Frame) -> Option<RgbImage> {
        let (x, y, w, h) = self.clamped(frame.width(), frame.height())?;
        Some(image::imageops::crop_imm(frame.image(), x, y, w, h).to_image())
    }
}

/// One recognised character and its horizontal position inside the plate crop.
#[derive(Clone, Debug, PartialEq)]
pub struct CharDetection {
    pub character: char,
    pub x: f32,
}

/// Output of the character-recognition boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Recognition {
    /// Per-character detections, in no particular order.
    Characters(Vec<CharDetection>),
    /// Whole-text OCR output, not yet normalised.
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_boxes_to_frame_bounds() {
        let b = DetectionBox::new(-10.0, 5.0, 30.0, 500.0, 0.9);
        assert_eq!(b.clamped(20, 100), Some((0, 5, 20, 95)));
    }

    #[test]
    fn box_outside_frame_has_no_crop() {
        let b = DetectionBox::new(50.0, 50.0, 60.0, 60.0, 0.9);
        assert_eq!(b.clamped(20, 20), None);

        let degenerate = DetectionBox::new(5.0, 5.0, 5.0, 9.0, 0.9);
        assert_eq!(degenerate.clamped(20, 20), None);
    }

    #[test]
    fn crop_copies_plate_region() {
        let frame = Frame::from_rgb(vec![7u8; 10 * 10 * 3], 10, 10, "enter").unwrap();
        let crop = DetectionBox::new(2.0, 3.0, 6.0, 5.0, 0.8).crop(&frame).unwrap();
        assert_eq!(crop.dimensions(), (4, 2));
    }
}
