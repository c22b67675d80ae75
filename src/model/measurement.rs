//! Measurement data model and category canonicalization.

use serde::{Deserialize, Serialize};

use crate::geometry::{Dimensions, MeasurementShape, Point};

/// Canonical measurement type for spores.
pub const SPORE_CATEGORY: &str = "spores";

/// Normalize a stored measurement type.
///
/// Empty, `manual`, `spore` and `spores` all mean spores; anything else is
/// kept as written.
pub fn canonical_measurement_type(raw: Option<&str>) -> String {
    let trimmed = raw.map(str::trim).unwrap_or("");
    match trimmed.to_ascii_lowercase().as_str() {
        "" | "manual" | "spore" | "spores" => SPORE_CATEGORY.to_string(),
        _ => trimmed.to_string(),
    }
}

/// Whether a stored measurement type counts as a spore.
pub fn is_spore_type(raw: Option<&str>) -> bool {
    canonical_measurement_type(raw) == SPORE_CATEGORY
}

/// Rotation applied when a measurement is shown in the spore gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GalleryRotation {
    R0,
    R90,
    R180,
    R270,
}

impl GalleryRotation {
    /// Accepts only multiples of 90 in [0, 270].
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        match degrees {
            0 => Some(GalleryRotation::R0),
            90 => Some(GalleryRotation::R90),
            180 => Some(GalleryRotation::R180),
            270 => Some(GalleryRotation::R270),
            _ => None,
        }
    }

    pub fn degrees(&self) -> i64 {
        match self {
            GalleryRotation::R0 => 0,
            GalleryRotation::R90 => 90,
            GalleryRotation::R180 => 180,
            GalleryRotation::R270 => 270,
        }
    }
}

/// A stored measurement row.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub id: i64,
    pub image_id: i64,
    pub length_um: f64,
    pub width_um: Option<f64>,
    /// Canonicalized measurement type.
    pub measurement_type: String,
    pub notes: Option<String>,
    pub points: [Option<Point>; 4],
    pub gallery_rotation: Option<GalleryRotation>,
    pub measured_at: String,
}

impl Measurement {
    pub fn shape(&self) -> Option<MeasurementShape> {
        MeasurementShape::from_points(&self.points)
    }

    /// Four-point geometry, if complete.
    pub fn rect_shape(&self) -> Option<MeasurementShape> {
        self.shape().filter(MeasurementShape::is_rect)
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            length_um: self.length_um,
            width_um: self.width_um,
        }
    }

    pub fn q(&self) -> Option<f64> {
        self.dimensions().q()
    }

    pub fn is_spore(&self) -> bool {
        self.measurement_type == SPORE_CATEGORY
    }
}

/// Fields supplied when storing a new measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMeasurement {
    pub length_um: f64,
    pub width_um: Option<f64>,
    pub measurement_type: Option<String>,
    pub notes: Option<String>,
    pub shape: Option<MeasurementShape>,
    pub gallery_rotation: Option<GalleryRotation>,
}

impl NewMeasurement {
    pub fn new(length_um: f64, width_um: Option<f64>) -> Self {
        Self {
            length_um,
            width_um,
            measurement_type: None,
            notes: None,
            shape: None,
            gallery_rotation: None,
        }
    }

    /// Build from geometry at a given scale, with the `Q=` note filled in.
    ///
    /// Returns `None` when the geometry is degenerate.
    pub fn from_shape(shape: MeasurementShape, microns_per_pixel: f64) -> Option<Self> {
        let dims = shape.dimensions(microns_per_pixel)?;
        Some(Self {
            length_um: dims.length_um,
            width_um: dims.width_um,
            measurement_type: None,
            notes: dims.q_note(),
            shape: Some(shape),
            gallery_rotation: None,
        })
    }

    pub fn with_type(mut self, measurement_type: impl Into<String>) -> Self {
        self.measurement_type = Some(measurement_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_measurement_type() {
        assert_eq!(canonical_measurement_type(None), "spores");
        assert_eq!(canonical_measurement_type(Some("")), "spores");
        assert_eq!(canonical_measurement_type(Some("manual")), "spores");
        assert_eq!(canonical_measurement_type(Some("Spore")), "spores");
        assert_eq!(canonical_measurement_type(Some("spores")), "spores");
        assert_eq!(canonical_measurement_type(Some("Basidia")), "Basidia");
        assert!(is_spore_type(Some("MANUAL")));
        assert!(!is_spore_type(Some("cheilocystidia")));
    }

    #[test]
    fn test_gallery_rotation() {
        assert_eq!(GalleryRotation::from_degrees(90), Some(GalleryRotation::R90));
        assert_eq!(GalleryRotation::from_degrees(45), None);
        assert_eq!(GalleryRotation::R270.degrees(), 270);
    }

    #[test]
    fn test_new_measurement_from_shape() {
        let shape = MeasurementShape::Rect {
            p1: Point::new(0.0, 0.0),
            p2: Point::new(100.0, 0.0),
            p3: Point::new(0.0, 0.0),
            p4: Point::new(0.0, 40.0),
        };
        let m = NewMeasurement::from_shape(shape, 0.0315).unwrap();
        assert!((m.length_um - 3.15).abs() < 1e-9);
        assert_eq!(m.notes.as_deref(), Some("Q=2.5"));

        let line = MeasurementShape::Line {
            p1: Point::new(0.0, 0.0),
            p2: Point::new(10.0, 0.0),
        };
        let m = NewMeasurement::from_shape(line, 0.5).unwrap();
        assert_eq!(m.width_um, None);
        assert_eq!(m.notes, None);
    }
}
