//! Recomputing stored measurements after a scale change.
//!
//! Per image, four-point measurements are re-derived from their pixel
//! coordinates. Per objective or calibration, every physical value is
//! multiplied by `s_new / s_old`.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::geometry::Dimensions;
use crate::model::Measurement;
use crate::scale::ObjectiveCatalog;

/// New values for one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct RescaledMeasurement {
    pub id: i64,
    pub length_um: f64,
    pub width_um: Option<f64>,
    pub notes: Option<String>,
}

/// Pending per-image rescale, built before asking the user to confirm.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RescalePlan {
    pub old_scale: f64,
    pub new_scale: f64,
    pub updates: Vec<RescaledMeasurement>,
    /// Measurements without all four points.
    pub skipped: usize,
}

impl RescalePlan {
    /// Whether there is anything to confirm.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Write every update in one transaction.
    pub fn apply(&self, db: &mut Database) -> Result<usize> {
        if self.updates.is_empty() {
            return Ok(0);
        }
        let rows: Vec<_> = self
            .updates
            .iter()
            .map(|u| (u.id, u.length_um, u.width_um, u.notes.clone()))
            .collect();
        db.apply_measurement_values(&rows)?;
        log::info!(
            "Rescaled {} measurements from {:.5} to {:.5} µm/px ({} skipped)",
            rows.len(),
            self.old_scale,
            self.new_scale,
            self.skipped
        );
        Ok(rows.len())
    }
}

fn check_scales(old_scale: f64, new_scale: f64) -> Result<()> {
    if !(old_scale > 0.0) || !(new_scale > 0.0) {
        return Err(Error::invalid_input(format!(
            "scales must be positive, got {} and {}",
            old_scale, new_scale
        )));
    }
    Ok(())
}

/// Recompute four-point measurements at `new_scale`.
pub fn plan_rescale(
    measurements: &[Measurement],
    old_scale: f64,
    new_scale: f64,
) -> Result<RescalePlan> {
    check_scales(old_scale, new_scale)?;
    let mut plan = RescalePlan {
        old_scale,
        new_scale,
        ..RescalePlan::default()
    };
    for m in measurements {
        let Some(shape) = m.rect_shape() else {
            plan.skipped += 1;
            continue;
        };
        let (d1, d2) = shape.pixel_lengths();
        let (d1, d2) = (d1 * new_scale, d2 * new_scale);
        let dims = Dimensions {
            length_um: d1.max(d2),
            width_um: Some(d1.min(d2)),
        };
        plan.updates.push(RescaledMeasurement {
            id: m.id,
            length_um: dims.length_um,
            width_um: dims.width_um,
            notes: dims.q_note().or_else(|| m.notes.clone()),
        });
    }
    Ok(plan)
}

/// Plan a rescale of every measurement on one image.
pub fn plan_image_rescale(
    db: &Database,
    image_id: i64,
    old_scale: f64,
    new_scale: f64,
) -> Result<RescalePlan> {
    let measurements = db.measurements_for_image(image_id)?;
    plan_rescale(&measurements, old_scale, new_scale)
}

/// Outcome of a bulk rescale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RescaleSummary {
    pub ratio: f64,
    pub measurements: usize,
}

/// Change an objective's scale and scale every bound measurement with it.
///
/// The catalog is updated in memory; the caller saves it.
pub fn rescale_objective(
    db: &mut Database,
    catalog: &mut ObjectiveCatalog,
    objective_key: &str,
    new_scale: f64,
) -> Result<RescaleSummary> {
    let old_scale = catalog
        .get(objective_key)
        .map(|o| o.microns_per_pixel)
        .ok_or_else(|| Error::invalid_input(format!("unknown objective {:?}", objective_key)))?;
    check_scales(old_scale, new_scale)?;
    let ratio = new_scale / old_scale;
    let measurements = db.scale_measurements_for_objective(objective_key, ratio, new_scale)?;
    catalog.set_scale(objective_key, new_scale)?;
    log::info!(
        "Objective {} rescaled by {:.6}: {} measurements",
        objective_key,
        ratio,
        measurements
    );
    Ok(RescaleSummary {
        ratio,
        measurements,
    })
}

/// Scale measurements on images that use one calibration after its value
/// changed from `old_scale` to `new_scale`.
pub fn rescale_calibration(
    db: &mut Database,
    calibration_id: i64,
    old_scale: f64,
    new_scale: f64,
) -> Result<RescaleSummary> {
    check_scales(old_scale, new_scale)?;
    let ratio = new_scale / old_scale;
    let measurements = db.scale_measurements_for_calibration(calibration_id, ratio, new_scale)?;
    log::info!(
        "Calibration {} rescaled by {:.6}: {} measurements",
        calibration_id,
        ratio,
        measurements
    );
    Ok(RescaleSummary {
        ratio,
        measurements,
    })
}

/// Scale measurements on images that resolve through an objective's catalog
/// value after that value changed, for instance when a new calibration was
/// activated. Images bound to a calibration row keep their values.
pub fn rescale_catalog_objective(
    db: &mut Database,
    objective_key: &str,
    old_scale: f64,
    new_scale: f64,
) -> Result<RescaleSummary> {
    check_scales(old_scale, new_scale)?;
    let ratio = new_scale / old_scale;
    let measurements = db.scale_measurements_for_catalog_objective(objective_key, ratio)?;
    log::info!(
        "Uncalibrated {} images rescaled by {:.6}: {} measurements",
        objective_key,
        ratio,
        measurements
    );
    Ok(RescaleSummary {
        ratio,
        measurements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{MeasurementShape, Point};
    use crate::model::{ImageRecord, ImageType, NewCalibration, NewMeasurement};

    fn rect() -> MeasurementShape {
        MeasurementShape::Rect {
            p1: Point::new(0.0, 0.0),
            p2: Point::new(100.0, 0.0),
            p3: Point::new(0.0, 0.0),
            p4: Point::new(0.0, 40.0),
        }
    }

    fn store_with_image(objective: &str, scale: f64) -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let image = db
            .insert_image(&ImageRecord {
                objective_name: Some(objective.into()),
                scale_microns_per_pixel: Some(scale),
                ..ImageRecord::new("/a.jpg", ImageType::Microscope)
            })
            .unwrap();
        (db, image)
    }

    #[test]
    fn test_rectangle_rescale() {
        let (mut db, image) = store_with_image("100X", 0.0315);
        let id = db
            .add_measurement(image, &NewMeasurement::from_shape(rect(), 0.0315).unwrap())
            .unwrap();
        let line = db
            .add_measurement(image, &NewMeasurement::new(2.0, None))
            .unwrap();

        let plan = plan_image_rescale(&db, image, 0.0315, 0.063).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.apply(&mut db).unwrap(), 1);

        let m = db.get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 6.30).abs() < 1e-9);
        assert!((m.width_um.unwrap() - 2.52).abs() < 1e-9);
        assert!((m.q().unwrap() - 2.5).abs() < 1e-9);
        assert_eq!(m.notes.as_deref(), Some("Q=2.5"));
        assert_eq!(db.get_measurement(line).unwrap().unwrap().length_um, 2.0);
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        assert!(plan_rescale(&[], 0.0, 0.1).is_err());
        assert!(plan_rescale(&[], 0.1, -0.1).is_err());
        assert!(plan_rescale(&[], 0.1, 0.2).unwrap().is_empty());
    }

    #[test]
    fn test_objective_rescale_roundtrip() {
        let (mut db, image) = store_with_image("100X", 0.0315);
        let id = db
            .add_measurement(image, &NewMeasurement::new(9.7, Some(6.3)))
            .unwrap();
        let mut catalog = ObjectiveCatalog::seeded();

        let summary = rescale_objective(&mut db, &mut catalog, "100X", 0.0330).unwrap();
        assert_eq!(summary.measurements, 1);
        assert_eq!(catalog.get("100X").unwrap().microns_per_pixel, 0.0330);
        assert_eq!(
            db.require_image(image).unwrap().scale_microns_per_pixel,
            Some(0.0330)
        );
        rescale_objective(&mut db, &mut catalog, "100X", 0.0315).unwrap();

        let m = db.get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 9.7).abs() / 9.7 < 1e-6);
        assert!((m.width_um.unwrap() - 6.3).abs() / 6.3 < 1e-6);

        assert!(rescale_objective(&mut db, &mut catalog, "63X", 0.05).is_err());
    }

    #[test]
    fn test_calibration_rescale_scales_by_ratio() {
        let mut db = Database::open_in_memory().unwrap();
        let cal = db
            .add_calibration(&NewCalibration::new("40X", 0.08))
            .unwrap();
        let bound = db
            .insert_image(&ImageRecord {
                objective_name: Some("40X".into()),
                calibration_id: Some(cal),
                scale_microns_per_pixel: Some(0.08),
                ..ImageRecord::new("/bound.jpg", ImageType::Microscope)
            })
            .unwrap();
        let other = db
            .insert_image(&ImageRecord {
                objective_name: Some("40X".into()),
                ..ImageRecord::new("/other.jpg", ImageType::Microscope)
            })
            .unwrap();
        let on_bound = db
            .add_measurement(bound, &NewMeasurement::new(8.0, Some(4.0)))
            .unwrap();
        let on_other = db
            .add_measurement(other, &NewMeasurement::new(8.0, None))
            .unwrap();

        let summary = rescale_calibration(&mut db, cal, 0.08, 0.1).unwrap();
        assert_eq!(summary.measurements, 1);
        assert!((summary.ratio - 1.25).abs() < 1e-12);

        let m = db.get_measurement(on_bound).unwrap().unwrap();
        assert!((m.length_um - 10.0).abs() < 1e-9);
        assert!((m.width_um.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(db.require_image(bound).unwrap().scale_microns_per_pixel, Some(0.1));
        assert_eq!(db.get_measurement(on_other).unwrap().unwrap().length_um, 8.0);
    }

    #[test]
    fn test_catalog_rescale_skips_calibrated_images() {
        let mut db = Database::open_in_memory().unwrap();
        let cal = db
            .add_calibration(&NewCalibration::new("40X", 0.08))
            .unwrap();
        let calibrated = db
            .insert_image(&ImageRecord {
                objective_name: Some("40X".into()),
                calibration_id: Some(cal),
                ..ImageRecord::new("/cal.jpg", ImageType::Microscope)
            })
            .unwrap();
        let nominal = db
            .insert_image(&ImageRecord {
                objective_name: Some("40X".into()),
                scale_microns_per_pixel: Some(0.05),
                ..ImageRecord::new("/nominal.jpg", ImageType::Microscope)
            })
            .unwrap();
        let kept = db
            .add_measurement(calibrated, &NewMeasurement::new(8.0, None))
            .unwrap();
        let scaled = db
            .add_measurement(nominal, &NewMeasurement::new(8.0, Some(4.0)))
            .unwrap();

        let summary = rescale_catalog_objective(&mut db, "40X", 0.08, 0.1).unwrap();
        assert_eq!(summary.measurements, 1);
        assert_eq!(db.get_measurement(kept).unwrap().unwrap().length_um, 8.0);
        let m = db.get_measurement(scaled).unwrap().unwrap();
        assert!((m.length_um - 10.0).abs() < 1e-9);
        let stored = db.require_image(nominal).unwrap().scale_microns_per_pixel.unwrap();
        assert!((stored - 0.0625).abs() < 1e-12);
    }
}
