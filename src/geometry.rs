//! Geometry primitives for spore measurements.
//!
//! All coordinates are image pixels with the origin at the top-left corner
//! and y pointing down. A measurement is either a single line or a
//! rectangle encoded as two lines; length is always the longer of the two.

use serde::{Deserialize, Serialize};

/// Lines shorter than this (in pixels) are treated as degenerate.
pub const DEGENERATE_EPSILON: f64 = 1e-3;

/// Default click tolerance for measurement hit-testing (in image pixels).
pub const HIT_TOLERANCE: f64 = 8.0;

/// A point in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    fn sub(&self, other: &Point) -> (f64, f64) {
        (self.x - other.x, self.y - other.y)
    }

    fn offset(&self, dir: (f64, f64), amount: f64) -> Point {
        Point::new(self.x + dir.0 * amount, self.y + dir.1 * amount)
    }
}

/// Euclidean distance between two points.
pub fn distance(a: &Point, b: &Point) -> f64 {
    a.distance_to(b)
}

/// Shortest distance from `p` to the segment `a`-`b`.
pub fn point_segment_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let (dx, dy) = b.sub(a);
    let len_sq = dx * dx + dy * dy;
    if len_sq <= f64::EPSILON {
        return p.distance_to(a);
    }
    let (px, py) = p.sub(a);
    let t = ((px * dx + py * dy) / len_sq).clamp(0.0, 1.0);
    p.distance_to(&a.offset((dx, dy), t))
}

/// Point-in-polygon test using ray casting.
///
/// Points lying exactly on an edge count as inside. Horizontal edges never
/// cross the ray, so they are skipped by the half-open comparison.
pub fn point_in_polygon(p: &Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        if point_segment_distance(p, &vertices[i], &vertices[j]) <= 1e-9 {
            return true;
        }
        j = i;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (xi, yi) = (vertices[i].x, vertices[i].y);
        let (xj, yj) = (vertices[j].x, vertices[j].y);
        if ((yi > p.y) != (yj > p.y)) && (p.x < (xj - xi) * (p.y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// An oriented rectangle reconstructed from two measurement lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientedRect {
    pub center: Point,
    /// Unit vector along the first line.
    pub length_dir: (f64, f64),
    /// Unit vector perpendicular to `length_dir`.
    pub width_dir: (f64, f64),
    pub half_length: f64,
    pub half_width: f64,
}

impl OrientedRect {
    /// Corners in winding order.
    pub fn corners(&self) -> [Point; 4] {
        let c = self.center;
        let along = |p: Point, s: f64| p.offset(self.length_dir, s * self.half_length);
        let across = |p: Point, s: f64| p.offset(self.width_dir, s * self.half_width);
        [
            along(across(c, -1.0), -1.0),
            along(across(c, -1.0), 1.0),
            along(across(c, 1.0), 1.0),
            along(across(c, 1.0), -1.0),
        ]
    }

    /// Edges as point pairs, following [`corners`](Self::corners).
    pub fn edges(&self) -> [(Point, Point); 4] {
        let c = self.corners();
        [(c[0], c[1]), (c[1], c[2]), (c[2], c[3]), (c[3], c[0])]
    }

    pub fn contains(&self, p: &Point) -> bool {
        point_in_polygon(p, &self.corners())
    }
}

/// Build an oriented rectangle from two lines `(p1, p2)` and `(p3, p4)`.
///
/// The first line fixes the orientation and the length. When the second line
/// runs across the first it gives the width directly; when it is an opposing
/// side (roughly parallel) the width is the perpendicular offset between the
/// two line midpoints. Returns `None` if either line is degenerate.
pub fn rectangle_from_lines(p1: &Point, p2: &Point, p3: &Point, p4: &Point) -> Option<OrientedRect> {
    let len1 = p1.distance_to(p2);
    let len2 = p3.distance_to(p4);
    if len1 < DEGENERATE_EPSILON || len2 < DEGENERATE_EPSILON {
        return None;
    }

    let (dx, dy) = p2.sub(p1);
    let length_dir = (dx / len1, dy / len1);
    let width_dir = (-length_dir.1, length_dir.0);

    let mid1 = p1.midpoint(p2);
    let mid2 = p3.midpoint(p4);
    let center = mid1.midpoint(&mid2);

    let (ex, ey) = p4.sub(p3);
    let cos = ((ex * length_dir.0 + ey * length_dir.1) / len2).abs();
    let half_width = if cos > std::f64::consts::FRAC_1_SQRT_2 {
        let (ox, oy) = mid2.sub(&mid1);
        (ox * width_dir.0 + oy * width_dir.1).abs() / 2.0
    } else {
        len2 / 2.0
    };

    Some(OrientedRect {
        center,
        length_dir,
        width_dir,
        half_length: len1 / 2.0,
        half_width,
    })
}

/// Physical dimensions of a measurement in microns.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dimensions {
    pub length_um: f64,
    pub width_um: Option<f64>,
}

impl Dimensions {
    /// Aspect ratio (length / width), if a positive width is known.
    pub fn q(&self) -> Option<f64> {
        self.width_um
            .filter(|w| *w > 0.0)
            .map(|w| self.length_um / w)
    }

    /// The `Q=x.y` note stored alongside rectangle measurements.
    pub fn q_note(&self) -> Option<String> {
        self.q().map(|q| format!("Q={:.1}", q))
    }
}

/// Geometry of a stored measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementShape {
    /// Length-only measurement.
    Line { p1: Point, p2: Point },
    /// Rectangle encoded as two lines; the longer one is the length.
    Rect {
        p1: Point,
        p2: Point,
        p3: Point,
        p4: Point,
    },
}

impl MeasurementShape {
    /// Reassemble a shape from optional stored points.
    ///
    /// Returns `None` unless either the first two or all four points are set.
    pub fn from_points(points: &[Option<Point>; 4]) -> Option<Self> {
        match points {
            [Some(p1), Some(p2), Some(p3), Some(p4)] => Some(MeasurementShape::Rect {
                p1: *p1,
                p2: *p2,
                p3: *p3,
                p4: *p4,
            }),
            [Some(p1), Some(p2), None, None] => Some(MeasurementShape::Line { p1: *p1, p2: *p2 }),
            _ => None,
        }
    }

    /// Stored point slots p1..p4.
    pub fn points(&self) -> [Option<Point>; 4] {
        match *self {
            MeasurementShape::Line { p1, p2 } => [Some(p1), Some(p2), None, None],
            MeasurementShape::Rect { p1, p2, p3, p4 } => [Some(p1), Some(p2), Some(p3), Some(p4)],
        }
    }

    pub fn is_rect(&self) -> bool {
        matches!(self, MeasurementShape::Rect { .. })
    }

    /// Line segments drawn for this shape.
    pub fn segments(&self) -> Vec<(Point, Point)> {
        match *self {
            MeasurementShape::Line { p1, p2 } => vec![(p1, p2)],
            MeasurementShape::Rect { p1, p2, p3, p4 } => vec![(p1, p2), (p3, p4)],
        }
    }

    /// Pixel lengths of the two lines (second is zero for a line shape).
    pub fn pixel_lengths(&self) -> (f64, f64) {
        match *self {
            MeasurementShape::Line { p1, p2 } => (p1.distance_to(&p2), 0.0),
            MeasurementShape::Rect { p1, p2, p3, p4 } => (p1.distance_to(&p2), p3.distance_to(&p4)),
        }
    }

    /// Rectangle derived from the two lines, for rect shapes.
    pub fn rectangle(&self) -> Option<OrientedRect> {
        match self {
            MeasurementShape::Line { .. } => None,
            MeasurementShape::Rect { p1, p2, p3, p4 } => rectangle_from_lines(p1, p2, p3, p4),
        }
    }

    /// Convert to physical dimensions at `microns_per_pixel`.
    ///
    /// Returns `None` for a degenerate first line.
    pub fn dimensions(&self, microns_per_pixel: f64) -> Option<Dimensions> {
        let (d1, d2) = self.pixel_lengths();
        match self {
            MeasurementShape::Line { .. } => (d1 >= DEGENERATE_EPSILON).then(|| Dimensions {
                length_um: d1 * microns_per_pixel,
                width_um: None,
            }),
            MeasurementShape::Rect { .. } => {
                if d1 < DEGENERATE_EPSILON || d2 < DEGENERATE_EPSILON {
                    return None;
                }
                Some(Dimensions {
                    length_um: d1.max(d2) * microns_per_pixel,
                    width_um: Some(d1.min(d2) * microns_per_pixel),
                })
            }
        }
    }

    /// The longer of the two lines (the length axis).
    pub fn length_line(&self) -> (Point, Point) {
        match *self {
            MeasurementShape::Line { p1, p2 } => (p1, p2),
            MeasurementShape::Rect { p1, p2, p3, p4 } => {
                if p3.distance_to(&p4) > p1.distance_to(&p2) {
                    (p3, p4)
                } else {
                    (p1, p2)
                }
            }
        }
    }

    /// Distance from `p` to this shape; zero inside its rectangle.
    pub fn distance_to_point(&self, p: &Point) -> f64 {
        let mut best = self
            .segments()
            .iter()
            .map(|(a, b)| point_segment_distance(p, a, b))
            .fold(f64::INFINITY, f64::min);
        if let Some(rect) = self.rectangle() {
            if rect.contains(p) {
                return 0.0;
            }
            for (a, b) in rect.edges() {
                best = best.min(point_segment_distance(p, &a, &b));
            }
        }
        best
    }
}

/// Find the shape under a click.
///
/// Returns the index of the closest shape within `tolerance`; ties go to the
/// earliest shape.
pub fn hit_test<'a, I>(shapes: I, p: &Point, tolerance: f64) -> Option<usize>
where
    I: IntoIterator<Item = &'a MeasurementShape>,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, shape) in shapes.into_iter().enumerate() {
        let d = shape.distance_to_point(p);
        if d > tolerance {
            continue;
        }
        if best.is_none_or(|(_, bd)| d < bd) {
            best = Some((idx, d));
        }
    }
    best.map(|(idx, _)| idx)
}
