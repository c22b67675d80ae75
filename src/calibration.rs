//! Scale-bar calibration: deriving µm/px from drawn segments, history and
//! calibration housekeeping.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::{is_under, uniquify_path};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::geometry::{DEGENERATE_EPSILON, Point};
use crate::model::{CUSTOM_OBJECTIVE, Calibration, CalibrationMeasurement, CalibrationStats};
use crate::rescale::{RescalePlan, plan_image_rescale};

/// Two-sided 95% normal quantile used for the confidence interval of the mean.
const Z_95: f64 = 1.959964;

/// Unit of a known scale-bar length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LengthUnit {
    #[default]
    Micrometers,
    Millimeters,
}

impl LengthUnit {
    /// Factor converting this unit to microns.
    pub fn to_microns(&self) -> f64 {
        match self {
            LengthUnit::Micrometers => 1.0,
            LengthUnit::Millimeters => 1000.0,
        }
    }
}

/// A drawn segment of known physical length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleBar {
    pub start: Point,
    pub end: Point,
    pub known_length: f64,
    pub unit: LengthUnit,
}

impl ScaleBar {
    pub fn new(start: Point, end: Point, known_length: f64, unit: LengthUnit) -> Self {
        Self {
            start,
            end,
            known_length,
            unit,
        }
    }

    pub fn pixel_distance(&self) -> f64 {
        self.start.distance_to(&self.end)
    }

    pub fn known_length_um(&self) -> f64 {
        self.known_length * self.unit.to_microns()
    }

    /// `known_length · unit / pixel_distance`.
    pub fn microns_per_pixel(&self) -> Result<f64> {
        let pixels = self.pixel_distance();
        if pixels < DEGENERATE_EPSILON {
            return Err(Error::invalid_input("scale bar has zero length"));
        }
        let length = self.known_length_um();
        if !(length > 0.0) {
            return Err(Error::invalid_input(format!(
                "known length must be positive, got {}",
                self.known_length
            )));
        }
        Ok(length / pixels)
    }

    /// The history entry recorded for this bar.
    pub fn record(&self, image_path: Option<&Path>, crop_source_size: Option<(u32, u32)>) -> Result<CalibrationMeasurement> {
        Ok(CalibrationMeasurement {
            image_path: image_path.map(Path::to_path_buf),
            pixel_distance: Some(self.pixel_distance()),
            known_length_um: Some(self.known_length_um()),
            microns_per_pixel: Some(self.microns_per_pixel()?),
            crop_source_size,
        })
    }
}

/// Mean scale and spread over repeated scale-bar readings.
///
/// Standard deviation and the interval need at least two readings.
pub fn calibration_stats(values: &[f64]) -> Option<(f64, CalibrationStats)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let mut stats = CalibrationStats {
        num_measurements: values.len() as i64,
        ..CalibrationStats::default()
    };
    if values.len() > 1 {
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = variance.sqrt();
        let half_width = Z_95 * std / n.sqrt();
        stats.std_dev = Some(std);
        stats.confidence_low = Some(mean - half_width);
        stats.confidence_high = Some(mean + half_width);
    }
    Some((mean, stats))
}

/// Summarize a set of recorded bar readings.
pub fn summarize_measurements(measurements: &[CalibrationMeasurement]) -> Option<(f64, CalibrationStats)> {
    let values: Vec<f64> = measurements
        .iter()
        .filter_map(|m| m.microns_per_pixel)
        .filter(|v| *v > 0.0)
        .collect();
    calibration_stats(&values)
}

/// Set an image's scale from a scale bar drawn on it.
///
/// The image is marked [`CUSTOM_OBJECTIVE`] with no calibration row.
/// `effective_scale` is the µm/px the image's measurements were taken at,
/// as resolved from its calibration or objective; `None` falls back to the
/// stored value. When that differs from the new scale, the returned plan
/// re-derives the four-point measurements; the caller applies it after
/// confirmation.
pub fn apply_custom_scale(
    db: &Database,
    image_id: i64,
    bar: &ScaleBar,
    effective_scale: Option<f64>,
) -> Result<(f64, Option<RescalePlan>)> {
    let image = db.require_image(image_id)?;
    let mpp = bar.microns_per_pixel()?;
    let old_scale = effective_scale.or(image.scale_microns_per_pixel);
    let plan = match old_scale.filter(|s| *s > 0.0) {
        Some(old) if (old - mpp).abs() > f64::EPSILON => {
            let plan = plan_image_rescale(db, image_id, old, mpp)?;
            (!plan.is_empty()).then_some(plan)
        }
        _ => None,
    };
    db.set_image_scale(image_id, Some(CUSTOM_OBJECTIVE), Some(mpp), None)?;
    log::info!("Image {} set to custom scale {:.6} µm/px", image_id, mpp);
    Ok((mpp, plan))
}

/// One row of an objective's calibration history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub calibration: Calibration,
    /// `(current − first) / first · 100`; `None` for the first row.
    pub diff_from_first_percent: Option<f64>,
}

/// Calibrations for an objective in date order, relative to the first.
pub fn calibration_history(db: &Database, objective_key: &str) -> Result<Vec<HistoryEntry>> {
    let calibrations = db.calibrations_for_objective(objective_key)?;
    let first = calibrations.first().map(|c| c.microns_per_pixel);
    Ok(calibrations
        .into_iter()
        .enumerate()
        .map(|(i, calibration)| {
            let diff = match first {
                Some(first) if i > 0 && first != 0.0 => {
                    Some((calibration.microns_per_pixel - first) / first * 100.0)
                }
                _ => None,
            };
            HistoryEntry {
                calibration,
                diff_from_first_percent: diff,
            }
        })
        .collect())
}

/// Copy a calibration fixture image into the calibrations folder.
pub fn store_calibration_image(source: &Path, calibrations_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| Error::invalid_input("calibration image has no file name"))?;
    fs::create_dir_all(calibrations_dir)?;
    let dest = uniquify_path(&calibrations_dir.join(name));
    fs::copy(source, &dest)?;
    Ok(dest)
}

/// Delete a calibration and the fixture images it owned.
///
/// Only files under one of `owned_roots` are removed. Returns the deleted
/// row and the number of files unlinked.
pub fn delete_calibration(db: &Database, id: i64, owned_roots: &[&Path]) -> Result<(Calibration, usize)> {
    let calibration = db.delete_calibration(id)?;
    let mut files: Vec<PathBuf> = calibration.image_filepath.iter().cloned().collect();
    files.extend(
        calibration
            .measurements()
            .into_iter()
            .filter_map(|m| m.image_path),
    );
    files.sort();
    files.dedup();

    let mut removed = 0;
    for path in files
        .iter()
        .filter(|p| owned_roots.iter().any(|root| is_under(p, root)))
    {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove calibration image {:?}: {}", path, e),
        }
    }
    log::info!(
        "Deleted calibration {} for {} ({} files)",
        id,
        calibration.objective_key,
        removed
    );
    Ok((calibration, removed))
}

/// Megapixels a calibration was made at, from its recorded crops or its image.
pub fn infer_megapixels(calibration: &Calibration) -> Option<f64> {
    let from_crops = calibration
        .measurements()
        .into_iter()
        .find_map(|m| m.crop_source_size);
    let size = from_crops
        .or(
            match (
                calibration.calibration_image_width,
                calibration.calibration_image_height,
            ) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            },
        )
        .or_else(|| {
            let path = calibration.image_filepath.as_deref()?;
            match image::image_dimensions(path) {
                Ok(size) => Some(size),
                Err(e) => {
                    log::debug!("No dimensions for {:?}: {}", path, e);
                    None
                }
            }
        })?;
    let mp = f64::from(size.0) * f64::from(size.1) / 1e6;
    (mp > 0.0).then_some(mp)
}

/// Fill in `megapixels` for calibrations recorded without it.
pub fn backfill_megapixels(db: &Database) -> Result<usize> {
    let mut updated = 0;
    for calibration in db.list_calibrations()? {
        if calibration.megapixels.is_some() {
            continue;
        }
        if let Some(mp) = infer_megapixels(&calibration) {
            db.set_calibration_megapixels(calibration.id, mp)?;
            updated += 1;
        }
    }
    if updated > 0 {
        log::info!("Backfilled megapixels on {} calibrations", updated);
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MeasurementShape;
    use crate::model::{ImageRecord, ImageType, NewCalibration, NewMeasurement};
    use tempfile::TempDir;

    fn bar(pixels: f64, length: f64, unit: LengthUnit) -> ScaleBar {
        ScaleBar::new(Point::new(10.0, 10.0), Point::new(10.0 + pixels, 10.0), length, unit)
    }

    #[test]
    fn test_scale_bar_units() {
        assert!((bar(200.0, 10.0, LengthUnit::Micrometers).microns_per_pixel().unwrap() - 0.05).abs() < 1e-12);
        assert!((bar(500.0, 1.0, LengthUnit::Millimeters).microns_per_pixel().unwrap() - 2.0).abs() < 1e-12);
        assert!(bar(0.0, 10.0, LengthUnit::Micrometers).microns_per_pixel().is_err());
        assert!(bar(100.0, 0.0, LengthUnit::Micrometers).microns_per_pixel().is_err());
    }

    #[test]
    fn test_calibration_stats() {
        let (mean, stats) = calibration_stats(&[0.31, 0.32, 0.33]).unwrap();
        assert!((mean - 0.32).abs() < 1e-12);
        assert!((stats.std_dev.unwrap() - 0.01).abs() < 1e-9);
        assert_eq!(stats.num_measurements, 3);
        assert!(stats.confidence_low.unwrap() < mean && stats.confidence_high.unwrap() > mean);

        let (_, single) = calibration_stats(&[0.5]).unwrap();
        assert_eq!(single.std_dev, None);
        assert!(calibration_stats(&[]).is_none());
    }

    #[test]
    fn test_history_diff_from_first() {
        let mut db = Database::open_in_memory().unwrap();
        db.add_calibration(&NewCalibration::new("40X", 0.080).with_date("2024-01-01"))
            .unwrap();
        db.add_calibration(&NewCalibration::new("40X", 0.084).with_date("2024-06-01"))
            .unwrap();
        let history = calibration_history(&db, "40X").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].diff_from_first_percent, None);
        assert!((history[1].diff_from_first_percent.unwrap() - 5.0).abs() < 1e-9);
        assert!(calibration_history(&db, "4X").unwrap().is_empty());
    }

    #[test]
    fn test_custom_scale_plans_rescale() {
        let db = Database::open_in_memory().unwrap();
        let image = db
            .insert_image(&ImageRecord {
                scale_microns_per_pixel: Some(0.0315),
                ..ImageRecord::new("/a.jpg", ImageType::Microscope)
            })
            .unwrap();
        let shape = MeasurementShape::Rect {
            p1: Point::new(0.0, 0.0),
            p2: Point::new(100.0, 0.0),
            p3: Point::new(0.0, 0.0),
            p4: Point::new(0.0, 40.0),
        };
        db.add_measurement(image, &NewMeasurement::from_shape(shape, 0.0315).unwrap())
            .unwrap();

        let (mpp, plan) = apply_custom_scale(&db, image, &bar(1000.0, 63.0, LengthUnit::Micrometers), None).unwrap();
        assert!((mpp - 0.063).abs() < 1e-12);
        let plan = plan.unwrap();
        assert!((plan.updates[0].length_um - 6.3).abs() < 1e-9);

        let stored = db.require_image(image).unwrap();
        assert!(stored.is_custom_scale());
        assert_eq!(stored.calibration_id, None);
    }

    #[test]
    fn test_custom_scale_uses_effective_scale() {
        let db = Database::open_in_memory().unwrap();
        let image = db
            .insert_image(&ImageRecord {
                objective_name: Some("100X".into()),
                ..ImageRecord::new("/a.jpg", ImageType::Microscope)
            })
            .unwrap();
        let shape = MeasurementShape::Rect {
            p1: Point::new(0.0, 0.0),
            p2: Point::new(100.0, 0.0),
            p3: Point::new(0.0, 0.0),
            p4: Point::new(0.0, 40.0),
        };
        db.add_measurement(image, &NewMeasurement::from_shape(shape, 0.0315).unwrap())
            .unwrap();

        let (_, plan) =
            apply_custom_scale(&db, image, &bar(1000.0, 63.0, LengthUnit::Micrometers), Some(0.0315))
                .unwrap();
        let plan = plan.unwrap();
        assert_eq!(plan.old_scale, 0.0315);
        assert!((plan.updates[0].length_um - 6.3).abs() < 1e-9);
    }

    #[test]
    fn test_delete_removes_owned_fixtures() {
        let dir = TempDir::new().unwrap();
        let cal_dir = dir.path().join("calibrations");
        let src = dir.path().join("bar.png");
        fs::write(&src, b"png").unwrap();
        let stored = store_calibration_image(&src, &cal_dir).unwrap();
        assert_eq!(stored, cal_dir.join("bar.png"));

        let mut db = Database::open_in_memory().unwrap();
        let mut new = NewCalibration::new("100X", 0.0315);
        new.image_filepath = Some(stored.clone());
        new.measurements = vec![bar(100.0, 3.15, LengthUnit::Micrometers)
            .record(Some(&src), None)
            .unwrap()];
        let id = db.add_calibration(&new).unwrap();

        let (row, removed) = delete_calibration(&db, id, &[cal_dir.as_path()]).unwrap();
        assert_eq!(row.id, id);
        assert_eq!(removed, 1);
        assert!(!stored.exists());
        assert!(src.exists());
        assert!(db.get_calibration(id).unwrap().is_none());
    }

    #[test]
    fn test_backfill_megapixels() {
        let mut db = Database::open_in_memory().unwrap();
        let mut from_crop = NewCalibration::new("10X", 0.314);
        from_crop.measurements = vec![CalibrationMeasurement {
            microns_per_pixel: Some(0.314),
            crop_source_size: Some((4000, 3000)),
            ..CalibrationMeasurement::default()
        }];
        let a = db.add_calibration(&from_crop).unwrap();

        let mut from_size = NewCalibration::new("40X", 0.079);
        from_size.calibration_image_size = Some((2000, 1500));
        let b = db.add_calibration(&from_size).unwrap();

        let unknown = db.add_calibration(&NewCalibration::new("4X", 1.2)).unwrap();

        assert_eq!(backfill_megapixels(&db).unwrap(), 2);
        assert_eq!(db.get_calibration(a).unwrap().unwrap().megapixels, Some(12.0));
        assert_eq!(db.get_calibration(b).unwrap().unwrap().megapixels, Some(3.0));
        assert_eq!(db.get_calibration(unknown).unwrap().unwrap().megapixels, None);
        assert_eq!(backfill_megapixels(&db).unwrap(), 0);
    }
}
