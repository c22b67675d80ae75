//! ML annotation records derived from four-point spore measurements.

use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// Default padding (pixels) added around a spore's points for its bounding box.
pub const DEFAULT_BBOX_PADDING: f64 = 50.0;

/// Annotation source for measurements drawn by hand.
pub const SOURCE_MANUAL: &str = "manual";

/// Annotation source for measurements placed by auto-measure.
pub const SOURCE_AUTO: &str = "auto";

/// Axis-aligned bounding box in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Enclose `points`, pad by `padding` and clamp to `[0, W] x [0, H]`.
    ///
    /// Returns `None` for an empty point list.
    pub fn around(points: &[Point], padding: f64, image_size: (u32, u32)) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let (w, h) = (f64::from(image_size.0), f64::from(image_size.1));
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

        let x1 = (min_x - padding).clamp(0.0, w);
        let y1 = (min_y - padding).clamp(0.0, h);
        let x2 = (max_x + padding).clamp(0.0, w);
        let y2 = (max_y + padding).clamp(0.0, h);

        Some(Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// A stored spore annotation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SporeAnnotation {
    pub id: i64,
    pub image_id: i64,
    pub measurement_id: Option<i64>,
    /// 1-based index of the spore within its image.
    pub spore_number: i64,
    pub bbox: BoundingBox,
    pub center: Point,
    pub length_um: f64,
    pub width_um: Option<f64>,
    pub rotation_angle: f64,
    pub source: String,
    pub created_at: Option<String>,
}
