//! Calibration rows. At most one row per objective is active.

use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Database, now_timestamp, path_to_sql};
use crate::error::{Error, Result};
use crate::model::{Calibration, NewCalibration};

pub(crate) const CALIBRATION_COLUMNS: &str = "id, objective_key, calibration_date, microns_per_pixel, \
     std_dev, confidence_low, confidence_high, num_measurements, measurements_json, image_filepath, \
     camera, megapixels, target_sampling_pct, resample_scale_factor, calibration_image_width, \
     calibration_image_height, notes, is_active, created_at";

pub(crate) fn calibration_from_row(row: &Row<'_>) -> rusqlite::Result<Calibration> {
    Ok(Calibration {
        id: row.get(0)?,
        objective_key: row.get(1)?,
        calibration_date: row.get(2)?,
        microns_per_pixel: row.get(3)?,
        std_dev: row.get(4)?,
        confidence_low: row.get(5)?,
        confidence_high: row.get(6)?,
        num_measurements: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        measurements_json: row.get(8)?,
        image_filepath: row.get::<_, Option<String>>(9)?.map(PathBuf::from),
        camera: row.get(10)?,
        megapixels: row.get(11)?,
        target_sampling_pct: row.get(12)?,
        resample_scale_factor: row.get(13)?,
        calibration_image_width: row.get(14)?,
        calibration_image_height: row.get(15)?,
        notes: row.get(16)?,
        is_active: row.get::<_, Option<bool>>(17)?.unwrap_or(false),
        created_at: row.get(18)?,
    })
}

/// Insert a full calibration row on `conn`, returning its id.
pub(crate) fn insert_calibration_row(conn: &Connection, c: &Calibration) -> Result<i64> {
    conn.execute(
        "INSERT INTO calibrations (objective_key, calibration_date, microns_per_pixel, std_dev,
             confidence_low, confidence_high, num_measurements, measurements_json, image_filepath,
             camera, megapixels, target_sampling_pct, resample_scale_factor,
             calibration_image_width, calibration_image_height, notes, is_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            c.objective_key,
            c.calibration_date,
            c.microns_per_pixel,
            c.std_dev,
            c.confidence_low,
            c.confidence_high,
            c.num_measurements,
            c.measurements_json,
            c.image_filepath.as_deref().map(path_to_sql),
            c.camera,
            c.megapixels,
            c.target_sampling_pct,
            c.resample_scale_factor,
            c.calibration_image_width,
            c.calibration_image_height,
            c.notes,
            c.is_active,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Record a calibration. When `set_active`, every other calibration for
    /// the same objective is deactivated in the same transaction.
    pub fn add_calibration(&mut self, new: &NewCalibration) -> Result<i64> {
        if !(new.microns_per_pixel > 0.0) || !new.microns_per_pixel.is_finite() {
            return Err(Error::invalid_input(format!(
                "calibration scale must be positive, got {}",
                new.microns_per_pixel
            )));
        }
        if new.objective_key.trim().is_empty() {
            return Err(Error::invalid_input("calibration needs an objective key"));
        }
        let measurements_json = if new.measurements.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&new.measurements)?)
        };
        let stats = new.stats.unwrap_or_default();
        let row = Calibration {
            id: 0,
            objective_key: new.objective_key.clone(),
            calibration_date: new.calibration_date.clone().unwrap_or_else(now_timestamp),
            microns_per_pixel: new.microns_per_pixel,
            std_dev: stats.std_dev,
            confidence_low: stats.confidence_low,
            confidence_high: stats.confidence_high,
            num_measurements: if new.stats.is_some() {
                stats.num_measurements
            } else {
                new.measurements.len() as i64
            },
            measurements_json,
            image_filepath: new.image_filepath.clone(),
            camera: new.camera.clone(),
            megapixels: new.megapixels,
            target_sampling_pct: new.target_sampling_pct,
            resample_scale_factor: new.resample_scale_factor,
            calibration_image_width: new.calibration_image_size.map(|s| s.0),
            calibration_image_height: new.calibration_image_size.map(|s| s.1),
            notes: new.notes.clone(),
            is_active: new.set_active,
            created_at: None,
        };

        let tx = self.conn.transaction()?;
        if new.set_active {
            tx.execute(
                "UPDATE calibrations SET is_active = 0 WHERE objective_key = ?1",
                params![new.objective_key],
            )?;
        }
        let id = insert_calibration_row(&tx, &row)?;
        tx.commit()?;
        log::info!(
            "Calibration {} for {}: {:.6} µm/px{}",
            id,
            new.objective_key,
            new.microns_per_pixel,
            if new.set_active { " (active)" } else { "" }
        );
        Ok(id)
    }

    pub fn get_calibration(&self, id: i64) -> Result<Option<Calibration>> {
        let c = self
            .conn
            .query_row(
                &format!("SELECT {} FROM calibrations WHERE id = ?1", CALIBRATION_COLUMNS),
                params![id],
                calibration_from_row,
            )
            .optional()?;
        Ok(c)
    }

    /// The active calibration for an objective, if any.
    pub fn active_calibration(&self, objective_key: &str) -> Result<Option<Calibration>> {
        let c = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM calibrations WHERE objective_key = ?1 AND is_active = 1
                     ORDER BY id DESC LIMIT 1",
                    CALIBRATION_COLUMNS
                ),
                params![objective_key],
                calibration_from_row,
            )
            .optional()?;
        Ok(c)
    }

    /// Every active calibration, one per objective.
    pub fn active_calibrations(&self) -> Result<Vec<Calibration>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM calibrations WHERE is_active = 1 ORDER BY objective_key",
            CALIBRATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], calibration_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Calibrations for one objective ordered by date.
    pub fn calibrations_for_objective(&self, objective_key: &str) -> Result<Vec<Calibration>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM calibrations WHERE objective_key = ?1 ORDER BY calibration_date, id",
            CALIBRATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![objective_key], calibration_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_calibrations(&self) -> Result<Vec<Calibration>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM calibrations ORDER BY id",
            CALIBRATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], calibration_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Make one calibration the active one for its objective.
    pub fn set_active_calibration(&mut self, id: i64) -> Result<Calibration> {
        let calibration = self
            .get_calibration(id)?
            .ok_or_else(|| Error::not_found("calibration", id))?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE calibrations SET is_active = CASE WHEN id = ?1 THEN 1 ELSE 0 END
             WHERE objective_key = ?2",
            params![id, calibration.objective_key],
        )?;
        tx.commit()?;
        Ok(Calibration {
            is_active: true,
            ..calibration
        })
    }

    /// Replace a calibration's µm/px, returning the previous value.
    pub fn set_calibration_scale(&self, id: i64, microns_per_pixel: f64) -> Result<f64> {
        let calibration = self
            .get_calibration(id)?
            .ok_or_else(|| Error::not_found("calibration", id))?;
        self.conn.execute(
            "UPDATE calibrations SET microns_per_pixel = ?1 WHERE id = ?2",
            params![microns_per_pixel, id],
        )?;
        Ok(calibration.microns_per_pixel)
    }

    pub fn set_calibration_megapixels(&self, id: i64, megapixels: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE calibrations SET megapixels = ?1 WHERE id = ?2",
            params![megapixels, id],
        )?;
        Ok(())
    }

    /// Remove a calibration row and return it.
    ///
    /// Images that referenced it keep a dangling `calibration_id`; scale
    /// resolution falls through to the next source for them.
    pub fn delete_calibration(&self, id: i64) -> Result<Calibration> {
        let calibration = self
            .get_calibration(id)?
            .ok_or_else(|| Error::not_found("calibration", id))?;
        self.conn
            .execute("DELETE FROM calibrations WHERE id = ?1", params![id])?;
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CalibrationMeasurement, CalibrationStats};

    #[test]
    fn test_active_calibration_switch() {
        let mut db = Database::open_in_memory().unwrap();
        let c1 = db
            .add_calibration(&NewCalibration::new("10X", 0.314))
            .unwrap();
        let c2 = db
            .add_calibration(&NewCalibration::new("10X", 0.312))
            .unwrap();
        let other = db
            .add_calibration(&NewCalibration::new("40X", 0.079))
            .unwrap();

        assert_eq!(db.active_calibration("10X").unwrap().unwrap().id, c2);
        assert!(!db.get_calibration(c1).unwrap().unwrap().is_active);
        assert!(db.get_calibration(other).unwrap().unwrap().is_active);

        db.set_active_calibration(c1).unwrap();
        assert_eq!(db.active_calibration("10X").unwrap().unwrap().id, c1);
        assert_eq!(db.active_calibrations().unwrap().len(), 2);
    }

    #[test]
    fn test_inactive_calibration_keeps_current() {
        let mut db = Database::open_in_memory().unwrap();
        let c1 = db
            .add_calibration(&NewCalibration::new("10X", 0.314))
            .unwrap();
        db.add_calibration(&NewCalibration::new("10X", 0.3).inactive())
            .unwrap();
        assert_eq!(db.active_calibration("10X").unwrap().unwrap().id, c1);
    }

    #[test]
    fn test_measurements_json_roundtrip() {
        let mut db = Database::open_in_memory().unwrap();
        let mut new = NewCalibration::new("100X", 0.0315).with_date("2024-01-02 10:00");
        new.measurements = vec![CalibrationMeasurement {
            pixel_distance: Some(317.5),
            known_length_um: Some(10.0),
            microns_per_pixel: Some(0.0315),
            crop_source_size: Some((4000, 3000)),
            ..CalibrationMeasurement::default()
        }];
        new.stats = Some(CalibrationStats {
            std_dev: Some(0.0002),
            confidence_low: Some(0.0313),
            confidence_high: Some(0.0317),
            num_measurements: 3,
        });
        let id = db.add_calibration(&new).unwrap();
        let stored = db.get_calibration(id).unwrap().unwrap();
        assert_eq!(stored.num_measurements, 3);
        assert_eq!(stored.measurements()[0].crop_source_size, Some((4000, 3000)));
        assert_eq!(stored.calibration_date, "2024-01-02 10:00");
    }

    #[test]
    fn test_rejects_invalid_scale() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.add_calibration(&NewCalibration::new("10X", 0.0)),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            db.delete_calibration(42),
            Err(Error::NotFound { .. })
        ));
    }
}
