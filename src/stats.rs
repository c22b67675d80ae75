//! Descriptive spore statistics and the literature summary string.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::model::Measurement;

/// Number of points on a confidence-ellipse boundary.
pub const ELLIPSE_SAMPLES: usize = 300;

/// Linear-interpolated percentile of sorted data, `pct` in [0, 100].
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let pos = (n - 1) as f64 * pct.clamp(0.0, 100.0) / 100.0;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
        }
    }
}

/// Summary of one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
}

impl Distribution {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: sorted.len(),
            mean,
            std: variance.sqrt(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p5: percentile(&sorted, 5.0)?,
            p50: percentile(&sorted, 50.0)?,
            p95: percentile(&sorted, 95.0)?,
        })
    }

    /// `(min–)p5–p95(–max)` with one decimal.
    pub fn range_string(&self, divisor: f64) -> String {
        format!(
            "({:.1}–){:.1}–{:.1}(–{:.1})",
            self.min / divisor,
            self.p5 / divisor,
            self.p95 / divisor,
            self.max / divisor
        )
    }
}

/// Unit used when printing physical values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisplayUnit {
    #[default]
    Micrometers,
    /// Used for field photos.
    Millimeters,
}

impl DisplayUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            DisplayUnit::Micrometers => "µm",
            DisplayUnit::Millimeters => "mm",
        }
    }

    /// Stored values are microns; divide by this on output.
    pub fn divisor(&self) -> f64 {
        match self {
            DisplayUnit::Micrometers => 1.0,
            DisplayUnit::Millimeters => 1000.0,
        }
    }
}

/// Statistics over a set of measurements.
///
/// Lengths use every measurement. Width and Q use only those with a
/// positive width, so line measurements count as length-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SporeStatistics {
    pub count: usize,
    pub length: Distribution,
    pub width: Option<Distribution>,
    pub q: Option<Distribution>,
}

impl SporeStatistics {
    /// Summarize `(length, width)` pairs; `None` for empty input.
    pub fn from_pairs(pairs: &[(f64, Option<f64>)]) -> Option<Self> {
        let lengths: Vec<f64> = pairs.iter().map(|(l, _)| *l).collect();
        let length = Distribution::from_values(&lengths)?;
        let with_width: Vec<(f64, f64)> = pairs
            .iter()
            .filter_map(|(l, w)| w.filter(|w| *w > 0.0).map(|w| (*l, w)))
            .collect();
        let widths: Vec<f64> = with_width.iter().map(|(_, w)| *w).collect();
        let ratios: Vec<f64> = with_width.iter().map(|(l, w)| l / w).collect();
        Some(Self {
            count: pairs.len(),
            length,
            width: Distribution::from_values(&widths),
            q: Distribution::from_values(&ratios),
        })
    }

    /// Summarize the spore measurements in `measurements`.
    pub fn from_measurements<'a, I>(measurements: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Measurement>,
    {
        let pairs: Vec<(f64, Option<f64>)> = measurements
            .into_iter()
            .filter(|m| m.is_spore() && m.length_um > 0.0)
            .map(|m| (m.length_um, m.width_um))
            .collect();
        Self::from_pairs(&pairs)
    }

    /// The literature summary in microns.
    pub fn literature_string(&self) -> String {
        self.literature_string_in(DisplayUnit::Micrometers)
    }

    /// The literature summary, for example
    /// `Spores: (8.0–)8.2–10.8(–11.0) µm x (5.0–)5.0–5.6(–5.6) µm, Q = ..., Qm = 1.8, n = 7`.
    pub fn literature_string_in(&self, unit: DisplayUnit) -> String {
        let divisor = unit.divisor();
        let symbol = unit.symbol();
        let mut out = format!("Spores: {} {}", self.length.range_string(divisor), symbol);
        if let (Some(width), Some(q)) = (&self.width, &self.q) {
            let _ = write!(
                out,
                " x {} {}, Q = {}, Qm = {:.1}",
                width.range_string(divisor),
                symbol,
                q.range_string(1.0),
                q.mean
            );
        }
        let _ = write!(out, ", n = {}", self.count);
        out
    }
}

/// Supported confidence levels for the length/width ellipse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    P90,
    P95,
    P99,
}

impl Confidence {
    /// Chi-squared quantile with two degrees of freedom.
    pub fn chi_squared(&self) -> f64 {
        match self {
            Confidence::P90 => 4.605170,
            Confidence::P95 => 5.991464,
            Confidence::P99 => 9.210340,
        }
    }

    pub fn from_level(level: f64) -> Option<Self> {
        if (level - 0.90).abs() < 1e-9 {
            Some(Confidence::P90)
        } else if (level - 0.95).abs() < 1e-9 {
            Some(Confidence::P95)
        } else if (level - 0.99).abs() < 1e-9 {
            Some(Confidence::P99)
        } else {
            None
        }
    }
}

/// Confidence ellipse over (length, width) points.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceEllipse {
    pub center: (f64, f64),
    /// Semi-axis along the first eigenvector (the larger one).
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Rotation of the major axis from the length axis, radians.
    pub angle: f64,
    pub boundary: Vec<(f64, f64)>,
}

/// Fit a confidence ellipse; needs at least two points.
pub fn confidence_ellipse(points: &[(f64, f64)], confidence: Confidence) -> Option<ConfidenceEllipse> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let my = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for (x, y) in points {
        sxx += (x - mx) * (x - mx);
        syy += (y - my) * (y - my);
        sxy += (x - mx) * (y - my);
    }
    let (sxx, syy, sxy) = (sxx / (n - 1.0), syy / (n - 1.0), sxy / (n - 1.0));

    // Eigenvalues of the symmetric 2x2 covariance.
    let trace_half = (sxx + syy) / 2.0;
    let disc = (((sxx - syy) / 2.0).powi(2) + sxy * sxy).sqrt();
    let l1 = (trace_half + disc).max(0.0);
    let l2 = (trace_half - disc).max(0.0);
    let angle = if sxy.abs() < f64::EPSILON {
        if sxx >= syy { 0.0 } else { std::f64::consts::FRAC_PI_2 }
    } else {
        (l1 - sxx).atan2(sxy)
    };

    let chi2 = confidence.chi_squared();
    let semi_major = (l1 * chi2).sqrt();
    let semi_minor = (l2 * chi2).sqrt();
    let (sin_a, cos_a) = angle.sin_cos();
    let boundary = (0..ELLIPSE_SAMPLES)
        .map(|i| {
            let t = std::f64::consts::TAU * i as f64 / (ELLIPSE_SAMPLES - 1) as f64;
            let (ex, ey) = (semi_major * t.cos(), semi_minor * t.sin());
            (mx + ex * cos_a - ey * sin_a, my + ex * sin_a + ey * cos_a)
        })
        .collect();

    Some(ConfidenceEllipse {
        center: (mx, my),
        semi_major,
        semi_minor,
        angle,
        boundary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LENGTHS: [f64; 7] = [8.0, 8.5, 9.0, 9.5, 10.0, 10.5, 11.0];
    const WIDTHS: [f64; 7] = [5.0, 5.1, 5.2, 5.3, 5.4, 5.5, 5.6];

    fn scenario() -> SporeStatistics {
        let pairs: Vec<_> = LENGTHS
            .iter()
            .zip(WIDTHS.iter())
            .map(|(l, w)| (*l, Some(*w)))
            .collect();
        SporeStatistics::from_pairs(&pairs).unwrap()
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), Some(1.0));
        assert_eq!(percentile(&sorted, 100.0), Some(4.0));
        assert!((percentile(&sorted, 50.0).unwrap() - 2.5).abs() < 1e-12);
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_literature_string() {
        let stats = scenario();
        let s = stats.literature_string();
        assert!(
            s.starts_with("Spores: (8.0–)8.2–10.8(–11.0) µm x (5.0–)5.0–5.6(–5.6) µm, Q = "),
            "{}",
            s
        );
        assert!(s.ends_with(", n = 7"));
        let q = stats.q.unwrap();
        assert!(s.contains(&format!("Qm = {:.1}", q.mean)));
        assert_eq!(stats.count, 7);
    }

    #[test]
    fn test_single_value() {
        let stats = SporeStatistics::from_pairs(&[(9.3, None)]).unwrap();
        assert_eq!(stats.length.p5, 9.3);
        assert_eq!(stats.length.p95, 9.3);
        assert_eq!(stats.length.std, 0.0);
        assert!(stats.q.is_none());
        assert_eq!(
            stats.literature_string(),
            "Spores: (9.3–)9.3–9.3(–9.3) µm, n = 1"
        );
        assert!(SporeStatistics::from_pairs(&[]).is_none());
    }

    #[test]
    fn test_line_measurements_excluded_from_width() {
        let stats =
            SporeStatistics::from_pairs(&[(10.0, Some(5.0)), (12.0, None), (8.0, Some(4.0))])
                .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.length.count, 3);
        assert_eq!(stats.width.unwrap().count, 2);
        assert!((stats.q.unwrap().mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_millimeter_display() {
        let stats = SporeStatistics::from_pairs(&[(45_000.0, None), (55_000.0, None)]).unwrap();
        assert_eq!(
            stats.literature_string_in(DisplayUnit::Millimeters),
            "Spores: (45.0–)45.5–54.5(–55.0) mm, n = 2"
        );
    }

    #[test]
    fn test_confidence_ellipse() {
        let points: Vec<(f64, f64)> = LENGTHS.iter().copied().zip(WIDTHS).collect();
        let ellipse = confidence_ellipse(&points, Confidence::P95).unwrap();
        assert_eq!(ellipse.boundary.len(), ELLIPSE_SAMPLES);
        assert!((ellipse.center.0 - 9.5).abs() < 1e-12);
        assert!((ellipse.center.1 - 5.3).abs() < 1e-12);
        assert!(ellipse.semi_major >= ellipse.semi_minor);

        // Axis-aligned case: variance only along x.
        let flat = [(1.0, 0.0), (3.0, 0.0)];
        let e = confidence_ellipse(&flat, Confidence::P90).unwrap();
        assert!((e.semi_major - (2.0f64 * 4.605170).sqrt()).abs() < 1e-9);
        assert!(e.semi_minor.abs() < 1e-12);
        assert!(e.angle.abs() < 1e-12);

        assert!(confidence_ellipse(&[(1.0, 1.0)], Confidence::P99).is_none());
        assert_eq!(Confidence::from_level(0.95), Some(Confidence::P95));
    }
}
