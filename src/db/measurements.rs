//! Measurement rows and the bulk updates used by rescaling.

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Database, now_timestamp};
use crate::error::{Error, Result};
use crate::geometry::{MeasurementShape, Point};
use crate::model::{
    GalleryRotation, Measurement, NewMeasurement, SourceType, canonical_measurement_type,
};

pub(crate) const MEASUREMENT_COLUMNS: &str = "id, image_id, length_um, width_um, measurement_type, \
     notes, p1_x, p1_y, p2_x, p2_y, p3_x, p3_y, p4_x, p4_y, gallery_rotation, measured_at";

fn point_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Point>> {
    let x: Option<f64> = row.get(idx)?;
    let y: Option<f64> = row.get(idx + 1)?;
    Ok(match (x, y) {
        (Some(x), Some(y)) => Some(Point::new(x, y)),
        _ => None,
    })
}

pub(crate) fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    let raw_type: Option<String> = row.get(4)?;
    let rotation: Option<i64> = row.get(14)?;
    Ok(Measurement {
        id: row.get(0)?,
        image_id: row.get(1)?,
        length_um: row.get(2)?,
        width_um: row.get(3)?,
        measurement_type: canonical_measurement_type(raw_type.as_deref()),
        notes: row.get(5)?,
        points: [
            point_at(row, 6)?,
            point_at(row, 8)?,
            point_at(row, 10)?,
            point_at(row, 12)?,
        ],
        gallery_rotation: rotation.and_then(GalleryRotation::from_degrees),
        measured_at: row.get::<_, Option<String>>(15)?.unwrap_or_default(),
    })
}

/// Flatten optional points into the eight coordinate columns.
fn coordinates(points: &[Option<Point>; 4]) -> [Option<f64>; 8] {
    let mut out = [None; 8];
    for (i, p) in points.iter().enumerate() {
        if let Some(p) = p {
            out[i * 2] = Some(p.x);
            out[i * 2 + 1] = Some(p.y);
        }
    }
    out
}

fn shape_points(shape: Option<&MeasurementShape>) -> [Option<Point>; 4] {
    shape.map(MeasurementShape::points).unwrap_or([None; 4])
}

fn validate(length_um: f64, width_um: Option<f64>, shape: Option<&MeasurementShape>) -> Result<()> {
    if !length_um.is_finite() || length_um <= 0.0 {
        return Err(Error::invalid_input(format!(
            "length must be positive, got {}",
            length_um
        )));
    }
    if let Some(width) = width_um {
        if !width.is_finite() || width < 0.0 {
            return Err(Error::invalid_input(format!(
                "width must not be negative, got {}",
                width
            )));
        }
    }
    if let Some(shape) = shape {
        if shape.points().iter().flatten().any(|p| p.x < 0.0 || p.y < 0.0) {
            return Err(Error::invalid_input("negative pixel coordinate"));
        }
    }
    Ok(())
}

/// Insert a complete measurement row on `conn`, returning its id.
pub(crate) fn insert_measurement_row(conn: &Connection, m: &Measurement) -> Result<i64> {
    let c = coordinates(&m.points);
    conn.execute(
        "INSERT INTO measurements (image_id, length_um, width_um, measurement_type, notes,
             p1_x, p1_y, p2_x, p2_y, p3_x, p3_y, p4_x, p4_y, gallery_rotation, measured_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            m.image_id,
            m.length_um,
            m.width_um,
            m.measurement_type,
            m.notes,
            c[0],
            c[1],
            c[2],
            c[3],
            c[4],
            c[5],
            c[6],
            c[7],
            m.gallery_rotation.map(|r| r.degrees()),
            m.measured_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Optional filters for [`Database::measurements_for_species`].
#[derive(Debug, Clone, Default)]
pub struct SpeciesFilter {
    pub source_type: Option<SourceType>,
    /// Compared after canonicalization, so `"spore"` matches stored `"manual"`.
    pub category: Option<String>,
    pub exclude_observation_id: Option<i64>,
}

impl SpeciesFilter {
    pub fn spores() -> Self {
        Self {
            category: Some(crate::model::SPORE_CATEGORY.to_string()),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source_type: SourceType) -> Self {
        self.source_type = Some(source_type);
        self
    }

    pub fn excluding(mut self, observation_id: i64) -> Self {
        self.exclude_observation_id = Some(observation_id);
        self
    }
}

impl Database {
    /// Store a new two- or four-point measurement.
    pub fn add_measurement(&self, image_id: i64, new: &NewMeasurement) -> Result<i64> {
        validate(new.length_um, new.width_um, new.shape.as_ref())?;
        if self.get_image(image_id)?.is_none() {
            return Err(Error::not_found("image", image_id));
        }
        let measurement = Measurement {
            id: 0,
            image_id,
            length_um: new.length_um,
            width_um: new.width_um,
            measurement_type: canonical_measurement_type(new.measurement_type.as_deref()),
            notes: new.notes.clone(),
            points: shape_points(new.shape.as_ref()),
            gallery_rotation: new.gallery_rotation,
            measured_at: now_timestamp(),
        };
        let id = insert_measurement_row(&self.conn, &measurement)?;
        log::debug!(
            "Measurement {} on image {}: {:.2} x {:?} µm",
            id,
            image_id,
            new.length_um,
            new.width_um
        );
        Ok(id)
    }

    pub fn get_measurement(&self, id: i64) -> Result<Option<Measurement>> {
        let m = self
            .conn
            .query_row(
                &format!("SELECT {} FROM measurements WHERE id = ?1", MEASUREMENT_COLUMNS),
                params![id],
                measurement_from_row,
            )
            .optional()?;
        Ok(m)
    }

    /// Measurements on one image, oldest first.
    pub fn measurements_for_image(&self, image_id: i64) -> Result<Vec<Measurement>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM measurements WHERE image_id = ?1 ORDER BY measured_at, id",
            MEASUREMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![image_id], measurement_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Measurements across every image of an observation, oldest first.
    pub fn measurements_for_observation(&self, observation_id: i64) -> Result<Vec<Measurement>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.image_id, m.length_um, m.width_um, m.measurement_type, m.notes,
                    m.p1_x, m.p1_y, m.p2_x, m.p2_y, m.p3_x, m.p3_y, m.p4_x, m.p4_y,
                    m.gallery_rotation, m.measured_at
             FROM measurements m JOIN images i ON i.id = m.image_id
             WHERE i.observation_id = ?1
             ORDER BY m.measured_at, m.id",
        )?;
        let rows = stmt
            .query_map(params![observation_id], measurement_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Measurements on observations of one species.
    pub fn measurements_for_species(
        &self,
        genus: &str,
        species: &str,
        filter: &SpeciesFilter,
    ) -> Result<Vec<Measurement>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.image_id, m.length_um, m.width_um, m.measurement_type, m.notes,
                    m.p1_x, m.p1_y, m.p2_x, m.p2_y, m.p3_x, m.p3_y, m.p4_x, m.p4_y,
                    m.gallery_rotation, m.measured_at, o.source_type, o.id
             FROM measurements m
             JOIN images i ON i.id = m.image_id
             JOIN observations o ON o.id = i.observation_id
             WHERE o.genus = ?1 AND o.species = ?2 AND m.length_um IS NOT NULL
             ORDER BY m.measured_at, m.id",
        )?;
        let category = filter
            .category
            .as_deref()
            .map(|c| canonical_measurement_type(Some(c)));
        let mut out = Vec::new();
        let rows = stmt.query_map(params![genus, species], |row| {
            let source: Option<String> = row.get(16)?;
            let observation_id: i64 = row.get(17)?;
            Ok((
                measurement_from_row(row)?,
                SourceType::parse(source.as_deref().unwrap_or("")),
                observation_id,
            ))
        })?;
        for row in rows {
            let (m, source, observation_id) = row?;
            if filter.source_type.is_some_and(|s| s != source) {
                continue;
            }
            if filter.exclude_observation_id == Some(observation_id) {
                continue;
            }
            if category.as_deref().is_some_and(|c| c != m.measurement_type) {
                continue;
            }
            out.push(m);
        }
        Ok(out)
    }

    /// Replace the points and physical values of a measurement together.
    pub fn update_points_and_dimensions(
        &self,
        id: i64,
        length_um: f64,
        width_um: Option<f64>,
        notes: Option<&str>,
        shape: &MeasurementShape,
    ) -> Result<()> {
        validate(length_um, width_um, Some(shape))?;
        let c = coordinates(&shape_points(Some(shape)));
        let changed = self.conn.execute(
            "UPDATE measurements SET length_um = ?1, width_um = ?2, notes = ?3,
                 p1_x = ?4, p1_y = ?5, p2_x = ?6, p2_y = ?7,
                 p3_x = ?8, p3_y = ?9, p4_x = ?10, p4_y = ?11
             WHERE id = ?12",
            params![length_um, width_um, notes, c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7], id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("measurement", id));
        }
        Ok(())
    }

    pub fn set_gallery_rotation(&self, id: i64, degrees: i64) -> Result<()> {
        let rotation = GalleryRotation::from_degrees(degrees).ok_or_else(|| {
            Error::invalid_input(format!("gallery rotation must be 0/90/180/270, got {}", degrees))
        })?;
        self.conn.execute(
            "UPDATE measurements SET gallery_rotation = ?1 WHERE id = ?2",
            params![rotation.degrees(), id],
        )?;
        Ok(())
    }

    /// Delete one measurement and its annotations.
    pub fn delete_measurement(&mut self, id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM spore_annotations WHERE measurement_id = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM measurements WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("measurement", id));
        }
        tx.commit()?;
        Ok(())
    }

    /// Write recomputed values for several measurements in one transaction.
    pub fn apply_measurement_values(
        &mut self,
        updates: &[(i64, f64, Option<f64>, Option<String>)],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE measurements SET length_um = ?1, width_um = ?2, notes = ?3 WHERE id = ?4",
            )?;
            for (id, length, width, notes) in updates {
                stmt.execute(params![length, width, notes, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Multiply lengths and widths on every image bound to an objective by
    /// `ratio`, and set those images' scale to `new_scale`.
    ///
    /// Returns the number of measurements touched.
    pub fn scale_measurements_for_objective(
        &mut self,
        objective_key: &str,
        ratio: f64,
        new_scale: f64,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let touched = tx.execute(
            "UPDATE measurements SET length_um = length_um * ?1,
                 width_um = CASE WHEN width_um IS NULL THEN NULL ELSE width_um * ?1 END
             WHERE image_id IN (SELECT id FROM images WHERE objective_name = ?2)",
            params![ratio, objective_key],
        )?;
        tx.execute(
            "UPDATE images SET scale_microns_per_pixel = ?1 WHERE objective_name = ?2",
            params![new_scale, objective_key],
        )?;
        tx.commit()?;
        Ok(touched)
    }

    /// Multiply lengths, widths and stored scales by `ratio` on the images of
    /// an objective that take their scale from the catalog, those without a
    /// calibration row.
    ///
    /// Returns the number of measurements touched.
    pub fn scale_measurements_for_catalog_objective(
        &mut self,
        objective_key: &str,
        ratio: f64,
    ) -> Result<usize> {
        const UNCALIBRATED: &str = "SELECT id FROM images WHERE objective_name = ?2
             AND (calibration_id IS NULL OR calibration_id NOT IN (SELECT id FROM calibrations))";
        let tx = self.conn.transaction()?;
        let touched = tx.execute(
            &format!(
                "UPDATE measurements SET length_um = length_um * ?1,
                     width_um = CASE WHEN width_um IS NULL THEN NULL ELSE width_um * ?1 END
                 WHERE image_id IN ({})",
                UNCALIBRATED
            ),
            params![ratio, objective_key],
        )?;
        tx.execute(
            &format!(
                "UPDATE images SET scale_microns_per_pixel = scale_microns_per_pixel * ?1
                 WHERE scale_microns_per_pixel IS NOT NULL AND id IN ({})",
                UNCALIBRATED
            ),
            params![ratio, objective_key],
        )?;
        tx.commit()?;
        Ok(touched)
    }

    /// Same as [`Database::scale_measurements_for_objective`] for images that
    /// reference one calibration.
    pub fn scale_measurements_for_calibration(
        &mut self,
        calibration_id: i64,
        ratio: f64,
        new_scale: f64,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let touched = tx.execute(
            "UPDATE measurements SET length_um = length_um * ?1,
                 width_um = CASE WHEN width_um IS NULL THEN NULL ELSE width_um * ?1 END
             WHERE image_id IN (SELECT id FROM images WHERE calibration_id = ?2)",
            params![ratio, calibration_id],
        )?;
        tx.execute(
            "UPDATE images SET scale_microns_per_pixel = ?1 WHERE calibration_id = ?2",
            params![new_scale, calibration_id],
        )?;
        tx.commit()?;
        Ok(touched)
    }
}
