//! One-click spore measurement by radial edge detection.
//!
//! From the click point, 18 lines through the centre (0°, 10°, ..., 170°)
//! are walked from the outer ring inwards on both sides. The first pixel
//! that differs from the background by more than the threshold marks the
//! spore edge on that side.

use image::GrayImage;

use crate::geometry::{MeasurementShape, Point};

/// Threshold used when an observation has not learned one yet.
pub const DEFAULT_THRESHOLD: f64 = 0.12;
pub const MIN_THRESHOLD: f64 = 0.02;
pub const MAX_THRESHOLD: f64 = 0.6;

/// Number of lines through the centre.
pub const RAY_COUNT: usize = 18;
const RAY_STEP_DEGREES: f64 = 10.0;

/// Samples on the background ring.
pub const BACKGROUND_SAMPLES: usize = 12;

/// Fewer hits than this is a failed detection.
pub const MIN_HITS: usize = 4;

/// Learned radius is widened by this factor for the background ring.
pub const MAX_RADIUS_MARGIN: f64 = 1.2;

/// Smallest absolute intensity difference that counts as an edge.
const MIN_EDGE_DELTA: f64 = 2.0;

/// Per-observation state that tunes detection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AutoMeasureParams {
    pub threshold: Option<f64>,
    pub max_radius: Option<f64>,
}

impl AutoMeasureParams {
    pub fn threshold(&self) -> f64 {
        self.threshold
            .unwrap_or(DEFAULT_THRESHOLD)
            .clamp(MIN_THRESHOLD, MAX_THRESHOLD)
    }
}

/// A successful detection in pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoMeasurement {
    /// Major axis as p1/p2, minor axis as p3/p4.
    pub shape: MeasurementShape,
    pub major_angle: f64,
    pub minor_angle: f64,
    pub major_radius: f64,
    pub minor_radius: f64,
    pub hits: usize,
    pub background: f64,
    pub center_intensity: f64,
}

impl AutoMeasurement {
    /// Largest radius seen, for updating the observation's learned maximum.
    pub fn largest_radius(&self) -> f64 {
        self.major_radius.max(self.minor_radius)
    }

    /// Threshold to remember once this measurement is saved.
    pub fn learned_threshold(&self) -> f64 {
        ((self.background - self.center_intensity).abs() / 255.0).clamp(MIN_THRESHOLD, MAX_THRESHOLD)
    }
}

/// Why a detection produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    OutsideImage,
    TooFewEdges,
}

/// Result of one auto-measure attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AutoMeasureOutcome {
    Measured(AutoMeasurement),
    Failed {
        reason: FailureReason,
        hits: usize,
        /// Per-ray radius in degrees order, for the debug view.
        radii: Vec<Option<f64>>,
    },
}

fn sample(image: &GrayImage, x: f64, y: f64) -> Option<f64> {
    let (w, h) = image.dimensions();
    let (xi, yi) = (x.round(), y.round());
    if xi < 0.0 || yi < 0.0 || xi >= f64::from(w) || yi >= f64::from(h) {
        return None;
    }
    Some(f64::from(image.get_pixel(xi as u32, yi as u32).0[0]))
}

fn sample_clamped(image: &GrayImage, x: f64, y: f64) -> f64 {
    let (w, h) = image.dimensions();
    let xi = x.round().clamp(0.0, f64::from(w.saturating_sub(1))) as u32;
    let yi = y.round().clamp(0.0, f64::from(h.saturating_sub(1))) as u32;
    f64::from(image.get_pixel(xi, yi).0[0])
}

fn background_mean(image: &GrayImage, center: Point, radius: f64) -> f64 {
    let total: f64 = (0..BACKGROUND_SAMPLES)
        .map(|i| {
            let angle = std::f64::consts::TAU * i as f64 / BACKGROUND_SAMPLES as f64;
            sample_clamped(
                image,
                center.x + radius * angle.cos(),
                center.y + radius * angle.sin(),
            )
        })
        .sum();
    total / BACKGROUND_SAMPLES as f64
}

/// Walk inwards along one half-ray; returns the edge radius.
fn walk(
    image: &GrayImage,
    center: Point,
    (dx, dy): (f64, f64),
    outer: f64,
    background: f64,
    delta: f64,
) -> Option<f64> {
    let mut r = outer.floor();
    while r >= 1.0 {
        if let Some(value) = sample(image, center.x + dx * r, center.y + dy * r) {
            if (value - background).abs() >= delta {
                return Some(r);
            }
        }
        r -= 1.0;
    }
    None
}

fn unit(angle_deg: f64) -> (f64, f64) {
    let a = angle_deg.to_radians();
    (a.cos(), a.sin())
}

/// Angular distance between two line directions, in [0, 90].
fn line_angle_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(180.0);
    d.min(180.0 - d)
}

/// Detect the spore under `click`.
pub fn auto_measure(
    image: &GrayImage,
    click: Point,
    params: &AutoMeasureParams,
) -> AutoMeasureOutcome {
    let (w, h) = image.dimensions();
    let Some(center_intensity) = sample(image, click.x, click.y) else {
        return AutoMeasureOutcome::Failed {
            reason: FailureReason::OutsideImage,
            hits: 0,
            radii: Vec::new(),
        };
    };

    let mut outer = f64::from(w.min(h)) / 2.0;
    if let Some(max_radius) = params.max_radius.filter(|r| *r > 0.0) {
        outer = outer.min(max_radius * MAX_RADIUS_MARGIN);
    }
    let background = background_mean(image, click, outer);
    let delta = (params.threshold() * 255.0).max(MIN_EDGE_DELTA);

    let radii: Vec<Option<f64>> = (0..RAY_COUNT)
        .map(|i| {
            let (dx, dy) = unit(i as f64 * RAY_STEP_DEGREES);
            let forward = walk(image, click, (dx, dy), outer, background, delta);
            let backward = walk(image, click, (-dx, -dy), outer, background, delta);
            match (forward, backward) {
                (Some(a), Some(b)) => Some((a + b) / 2.0),
                (Some(a), None) | (None, Some(a)) => Some(a),
                (None, None) => None,
            }
        })
        .collect();

    let hits: Vec<(f64, f64)> = radii
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.map(|r| (i as f64 * RAY_STEP_DEGREES, r)))
        .collect();
    log::debug!(
        "Auto-measure at ({:.0}, {:.0}): bg {:.1}, delta {:.1}, {} hits",
        click.x,
        click.y,
        background,
        delta,
        hits.len()
    );
    if hits.len() < MIN_HITS {
        return AutoMeasureOutcome::Failed {
            reason: FailureReason::TooFewEdges,
            hits: hits.len(),
            radii,
        };
    }

    let (major_angle, major_radius) = hits
        .iter()
        .copied()
        .fold((0.0, f64::NEG_INFINITY), |best, cur| {
            if cur.1 > best.1 { cur } else { best }
        });
    let target = (major_angle + 90.0).rem_euclid(180.0);
    let (minor_angle, minor_radius, _) = hits
        .iter()
        .copied()
        .filter(|(angle, _)| *angle != major_angle)
        .fold((0.0, 0.0, f64::INFINITY), |best, (angle, r)| {
            let d = line_angle_distance(angle, target);
            if d < best.2 { (angle, r, d) } else { best }
        });

    // endpoints may fall outside the frame for spores cut by the border
    let endpoint = |angle: f64, r: f64, sign: f64| {
        let (dx, dy) = unit(angle);
        Point::new(click.x + sign * dx * r, click.y + sign * dy * r)
    };

    AutoMeasureOutcome::Measured(AutoMeasurement {
        shape: MeasurementShape::Rect {
            p1: endpoint(major_angle, major_radius, -1.0),
            p2: endpoint(major_angle, major_radius, 1.0),
            p3: endpoint(minor_angle, minor_radius, -1.0),
            p4: endpoint(minor_angle, minor_radius, 1.0),
        },
        major_angle,
        minor_angle,
        major_radius,
        minor_radius,
        hits: hits.len(),
        background,
        center_intensity,
    })
}

/// New learned maximum radius after a detection.
pub fn updated_max_radius(current: Option<f64>, measured: f64) -> f64 {
    current.map_or(measured, |c| c.max(measured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// 200x200 light frame with a dark ellipse (a=30 along x, b=15 along y).
    fn ellipse_image() -> GrayImage {
        GrayImage::from_fn(200, 200, |x, y| {
            let dx = (x as f64 - 100.0) / 30.0;
            let dy = (y as f64 - 100.0) / 15.0;
            if dx * dx + dy * dy <= 1.0 {
                Luma([60u8])
            } else {
                Luma([200u8])
            }
        })
    }

    #[test]
    fn test_detects_ellipse_axes() {
        let image = ellipse_image();
        let outcome = auto_measure(
            &image,
            Point::new(100.0, 100.0),
            &AutoMeasureParams::default(),
        );
        let AutoMeasureOutcome::Measured(m) = outcome else {
            panic!("expected a measurement, got {:?}", outcome);
        };
        assert_eq!(m.major_angle, 0.0);
        assert_eq!(m.minor_angle, 90.0);
        assert!((m.major_radius - 30.0).abs() <= 1.0);
        assert!((m.minor_radius - 15.0).abs() <= 1.0);
        assert_eq!(m.hits, RAY_COUNT);

        let dims = m.shape.dimensions(0.1).unwrap();
        assert!((dims.length_um - 6.0).abs() < 0.25);
        assert!((dims.width_um.unwrap() - 3.0).abs() < 0.25);
        assert!((m.learned_threshold() - 140.0 / 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_border_spore_keeps_symmetric_axes() {
        // ellipse cut by the left border of the frame
        let image = GrayImage::from_fn(120, 120, |x, y| {
            let dx = (x as f64 - 20.0) / 30.0;
            let dy = (y as f64 - 60.0) / 15.0;
            if dx * dx + dy * dy <= 1.0 {
                Luma([60u8])
            } else {
                Luma([200u8])
            }
        });
        let outcome = auto_measure(&image, Point::new(20.0, 60.0), &AutoMeasureParams::default());
        let AutoMeasureOutcome::Measured(m) = outcome else {
            panic!("expected a measurement, got {:?}", outcome);
        };
        let MeasurementShape::Rect { p1, p2, .. } = m.shape else {
            panic!("expected a rectangle");
        };
        assert!(p1.x.min(p2.x) < 0.0);

        let dims = m.shape.dimensions(0.1).unwrap();
        assert!((dims.length_um - 2.0 * m.major_radius * 0.1).abs() < 1e-9);
        assert!((dims.width_um.unwrap() - 2.0 * m.minor_radius * 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_uniform_image_fails() {
        let image = GrayImage::from_pixel(100, 100, Luma([128u8]));
        let outcome = auto_measure(
            &image,
            Point::new(50.0, 50.0),
            &AutoMeasureParams::default(),
        );
        assert!(matches!(
            outcome,
            AutoMeasureOutcome::Failed {
                reason: FailureReason::TooFewEdges,
                hits: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_click_outside_image() {
        let image = ellipse_image();
        let outcome = auto_measure(
            &image,
            Point::new(250.0, 10.0),
            &AutoMeasureParams::default(),
        );
        assert!(matches!(
            outcome,
            AutoMeasureOutcome::Failed {
                reason: FailureReason::OutsideImage,
                ..
            }
        ));
    }

    #[test]
    fn test_learned_radius_limits_ring() {
        let image = ellipse_image();
        let params = AutoMeasureParams {
            threshold: Some(0.3),
            max_radius: Some(40.0),
        };
        let AutoMeasureOutcome::Measured(m) =
            auto_measure(&image, Point::new(100.0, 100.0), &params)
        else {
            panic!("expected a measurement");
        };
        assert!((m.major_radius - 30.0).abs() <= 1.0);
        assert_eq!(updated_max_radius(Some(40.0), m.largest_radius()), 40.0);
        assert_eq!(updated_max_radius(None, 12.0), 12.0);
    }

    #[test]
    fn test_threshold_is_clamped() {
        let params = AutoMeasureParams {
            threshold: Some(0.9),
            max_radius: None,
        };
        assert_eq!(params.threshold(), MAX_THRESHOLD);
        assert_eq!(AutoMeasureParams::default().threshold(), DEFAULT_THRESHOLD);
    }
}
