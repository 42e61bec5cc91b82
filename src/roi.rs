//! Region-of-interest gating.
//!
//! A detection is actionable only when the centroid of its box lies inside the
//! camera's polygon. Points on an edge or vertex count as inside. Without a
//! polygon every detection passes.

use anyhow::{anyhow, Result};

use crate::detect::DetectionBox;
use crate::pipeline::CameraRole;

/// Tolerance for the on-edge test, in pixels.
const EDGE_EPSILON: f32 = 1e-3;

/// Closed polygon in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    points: Vec<(f32, f32)>,
}

impl Polygon {
    pub fn new(points: Vec<(f32, f32)>) -> Result<Self> {
        if points.len() < 3 {
            return Err(anyhow!(
                "polygon needs at least 3 points, got {}",
                points.len()
            ));
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(anyhow!("polygon points must be finite"));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    fn edges(&self) -> impl Iterator<Item = ((f32, f32), (f32, f32))> + '_ {
        self.points
            .iter()
            .copied()
            .zip(self.points.iter().copied().cycle().skip(1))
    }

    /// Boundary-inclusive point-in-polygon test.
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        if self.edges().any(|(a, b)| on_segment((x, y), a, b)) {
            return true;
        }
        // Even-odd ray cast towards +x.
        let mut inside = false;
        for ((x1, y1), (x2, y2)) in self.edges() {
            if (y1 > y) != (y2 > y) {
                let crossing = x1 + (y - y1) * (x2 - x1) / (y2 - y1);
                if x < crossing {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

fn on_segment(p: (f32, f32), a: (f32, f32), b: (f32, f32)) -> bool {
    let cross = (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0);
    let length = ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt();
    if cross.abs() > EDGE_EPSILON * length.max(1.0) {
        return false;
    }
    p.0 >= a.0.min(b.0) - EDGE_EPSILON
        && p.0 <= a.0.max(b.0) + EDGE_EPSILON
        && p.1 >= a.1.min(b.1) - EDGE_EPSILON
        && p.1 <= a.1.max(b.1) + EDGE_EPSILON
}

/// Per-camera ROI filter.
#[derive(Clone, Debug, Default)]
pub struct RoiGate {
    polygon: Option<Polygon>,
}

impl RoiGate {
    /// Gate that admits every detection.
    pub fn disabled() -> Self {
        Self { polygon: None }
    }

    pub fn new(polygon: Polygon) -> Self {
        Self {
            polygon: Some(polygon),
        }
    }

    /// Gate using the deployed polygon for `role`, scaled to a `width` x `height` frame.
    pub fn for_role(role: CameraRole, width: u32, height: u32) -> Result<Self> {
        Ok(Self::new(default_polygon(role, width, height)?))
    }

    /// Whether the centroid of `bbox` lies inside `polygon` (or no polygon is set).
    pub fn contains(bbox: &DetectionBox, polygon: Option<&Polygon>) -> bool {
        match polygon {
            Some(polygon) => {
                let (cx, cy) = bbox.centroid();
                polygon.contains_point(cx, cy)
            }
            None => true,
        }
    }

    pub fn admits(&self, bbox: &DetectionBox) -> bool {
        Self::contains(bbox, self.polygon.as_ref())
    }

    pub fn polygon(&self) -> Option<&Polygon> {
        self.polygon.as_ref()
    }
}

/// Gate polygon for a camera role, computed from the frame size with integer
/// division.
pub fn default_polygon(role: CameraRole, width: u32, height: u32) -> Result<Polygon> {
    let (w, h) = (width, height);
    let points = match role {
        CameraRole::Enter => [
            (w / 8, h / 4),
            (4 * w / 5, h / 6),
            (12 * w / 13, 3 * h / 4),
            (w / 6, 9 * h / 10),
        ],
        CameraRole::Exit => [
            (5 * w / 16, 2 * h / 5),
            (w / 2, 2 * h / 5),
            (12 * w / 13, 3 * h / 4),
            (w / 6, 9 * h / 10),
        ],
    };
    Polygon::new(
        points
            .iter()
            .map(|&(x, y)| (x as f32, y as f32))
            .collect(),
    )
}
