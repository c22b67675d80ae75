//! Image rows.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Database, DeletedFiles, path_to_sql};
use crate::error::{Error, Result};
use crate::model::{CropBox, ImageRecord, ImageType};

pub(crate) const IMAGE_COLUMNS: &str = "id, observation_id, filepath, original_filepath, image_type, \
     micro_category, objective_name, scale_microns_per_pixel, calibration_id, mount_medium, \
     sample_type, contrast, measure_color, notes, crop_box_x1, crop_box_y1, crop_box_x2, \
     crop_box_y2, crop_source_w, crop_source_h, gps_source, resample_scale_factor, created_at";

pub(crate) fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let crop: [Option<f64>; 4] = [row.get(14)?, row.get(15)?, row.get(16)?, row.get(17)?];
    let crop_box = match crop {
        [Some(x1), Some(y1), Some(x2), Some(y2)] => Some(CropBox { x1, y1, x2, y2 }),
        _ => None,
    };
    let crop_source_size = match (row.get::<_, Option<u32>>(18)?, row.get::<_, Option<u32>>(19)?) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    };
    Ok(ImageRecord {
        id: row.get(0)?,
        observation_id: row.get(1)?,
        filepath: PathBuf::from(row.get::<_, String>(2)?),
        original_filepath: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
        image_type: ImageType::parse(&row.get::<_, Option<String>>(4)?.unwrap_or_default()),
        micro_category: row.get(5)?,
        objective_name: row.get(6)?,
        scale_microns_per_pixel: row.get(7)?,
        calibration_id: row.get(8)?,
        mount_medium: row.get(9)?,
        sample_type: row.get(10)?,
        contrast: row.get(11)?,
        measure_color: row.get(12)?,
        notes: row.get(13)?,
        crop_box,
        crop_source_size,
        gps_source: row.get::<_, Option<bool>>(20)?.unwrap_or(false),
        resample_scale_factor: row.get::<_, Option<f64>>(21)?.unwrap_or(1.0),
        created_at: row.get(22)?,
    })
}

/// Insert a full image row on `conn`, returning its id.
pub(crate) fn insert_image_row(conn: &Connection, image: &ImageRecord) -> Result<i64> {
    let crop = image.crop_box;
    conn.execute(
        "INSERT INTO images (observation_id, filepath, original_filepath, image_type, micro_category,
             objective_name, scale_microns_per_pixel, calibration_id, mount_medium, sample_type,
             contrast, measure_color, notes, crop_box_x1, crop_box_y1, crop_box_x2, crop_box_y2,
             crop_source_w, crop_source_h, gps_source, resample_scale_factor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
             ?19, ?20, ?21)",
        params![
            image.observation_id,
            path_to_sql(&image.filepath),
            image.original_filepath.as_deref().map(path_to_sql),
            image.image_type.as_str(),
            image.micro_category,
            image.objective_name,
            image.scale_microns_per_pixel,
            image.calibration_id,
            image.mount_medium,
            image.sample_type,
            image.contrast,
            image.measure_color,
            image.notes,
            crop.map(|c| c.x1),
            crop.map(|c| c.y1),
            crop.map(|c| c.x2),
            crop.map(|c| c.y2),
            image.crop_source_size.map(|s| s.0),
            image.crop_source_size.map(|s| s.1),
            image.gps_source,
            image.resample_scale_factor,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn validate(image: &ImageRecord) -> Result<()> {
    if let Some(scale) = image.scale_microns_per_pixel {
        if !(scale > 0.0) {
            return Err(Error::invalid_input(format!(
                "scale must be positive, got {}",
                scale
            )));
        }
    }
    if !(image.resample_scale_factor > 0.0) {
        return Err(Error::invalid_input(format!(
            "resample factor must be positive, got {}",
            image.resample_scale_factor
        )));
    }
    Ok(())
}

impl Database {
    /// Insert an image row. The file is expected to already be in place.
    pub fn insert_image(&self, image: &ImageRecord) -> Result<i64> {
        validate(image)?;
        insert_image_row(&self.conn, image)
    }

    pub fn get_image(&self, id: i64) -> Result<Option<ImageRecord>> {
        let image = self
            .conn
            .query_row(
                &format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS),
                params![id],
                image_from_row,
            )
            .optional()?;
        Ok(image)
    }

    pub fn require_image(&self, id: i64) -> Result<ImageRecord> {
        self.get_image(id)?.ok_or_else(|| Error::not_found("image", id))
    }

    pub fn images_for_observation(&self, observation_id: i64) -> Result<Vec<ImageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images WHERE observation_id = ?1 ORDER BY id",
            IMAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![observation_id], image_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All images in id order.
    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM images ORDER BY id", IMAGE_COLUMNS))?;
        let rows = stmt
            .query_map([], image_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Images bound to an objective catalog key.
    pub fn images_for_objective(&self, objective_key: &str) -> Result<Vec<ImageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images WHERE objective_name = ?1 ORDER BY id",
            IMAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![objective_key], image_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Images that point at a specific calibration.
    pub fn images_for_calibration(&self, calibration_id: i64) -> Result<Vec<ImageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images WHERE calibration_id = ?1 ORDER BY id",
            IMAGE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![calibration_id], image_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set the scale fields of an image.
    pub fn set_image_scale(
        &self,
        id: i64,
        objective_name: Option<&str>,
        microns_per_pixel: Option<f64>,
        calibration_id: Option<i64>,
    ) -> Result<()> {
        if let Some(scale) = microns_per_pixel {
            if !(scale > 0.0) {
                return Err(Error::invalid_input(format!(
                    "scale must be positive, got {}",
                    scale
                )));
            }
        }
        let changed = self.conn.execute(
            "UPDATE images SET objective_name = ?1, scale_microns_per_pixel = ?2, calibration_id = ?3
             WHERE id = ?4",
            params![objective_name, microns_per_pixel, calibration_id, id],
        )?;
        if changed == 0 {
            return Err(Error::not_found("image", id));
        }
        Ok(())
    }

    pub fn set_image_filepath(&self, id: i64, filepath: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE images SET filepath = ?1 WHERE id = ?2",
            params![path_to_sql(filepath), id],
        )?;
        Ok(())
    }

    pub fn set_image_crop(
        &self,
        id: i64,
        crop_box: Option<CropBox>,
        crop_source_size: Option<(u32, u32)>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE images SET crop_box_x1 = ?1, crop_box_y1 = ?2, crop_box_x2 = ?3, crop_box_y2 = ?4,
                 crop_source_w = ?5, crop_source_h = ?6
             WHERE id = ?7",
            params![
                crop_box.map(|c| c.x1),
                crop_box.map(|c| c.y1),
                crop_box.map(|c| c.x2),
                crop_box.map(|c| c.y2),
                crop_source_size.map(|s| s.0),
                crop_source_size.map(|s| s.1),
                id
            ],
        )?;
        Ok(())
    }

    /// Delete an image with its annotations, measurements and thumbnails.
    ///
    /// Returns the files that belonged to it; unlinking is left to the caller.
    pub fn delete_image_cascade(&mut self, id: i64) -> Result<DeletedFiles> {
        let files = self.owned_files("i.id = ?1", id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM spore_annotations WHERE image_id = ?1
                 OR measurement_id IN (SELECT id FROM measurements WHERE image_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM measurements WHERE image_id = ?1", params![id])?;
        tx.execute("DELETE FROM thumbnails WHERE image_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("image", id));
        }
        tx.commit()?;
        Ok(files)
    }
}
