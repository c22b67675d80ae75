//! Spore annotation rows for ML export.

use rusqlite::{Connection, Row, params};

use super::Database;
use crate::error::Result;
use crate::geometry::Point;
use crate::model::{BoundingBox, SporeAnnotation};

pub(crate) const ANNOTATION_COLUMNS: &str = "id, image_id, measurement_id, spore_number, bbox_x, \
     bbox_y, bbox_width, bbox_height, center_x, center_y, length_um, width_um, rotation_angle, \
     source, created_at";

pub(crate) fn annotation_from_row(row: &Row<'_>) -> rusqlite::Result<SporeAnnotation> {
    Ok(SporeAnnotation {
        id: row.get(0)?,
        image_id: row.get(1)?,
        measurement_id: row.get(2)?,
        spore_number: row.get(3)?,
        bbox: BoundingBox {
            x: row.get(4)?,
            y: row.get(5)?,
            width: row.get(6)?,
            height: row.get(7)?,
        },
        center: Point::new(row.get(8)?, row.get(9)?),
        length_um: row.get(10)?,
        width_um: row.get(11)?,
        rotation_angle: row.get(12)?,
        source: row.get(13)?,
        created_at: row.get(14)?,
    })
}

pub(crate) fn insert_annotation_row(conn: &Connection, a: &SporeAnnotation) -> Result<i64> {
    conn.execute(
        "INSERT INTO spore_annotations (image_id, measurement_id, spore_number, bbox_x, bbox_y,
             bbox_width, bbox_height, center_x, center_y, length_um, width_um, rotation_angle,
             source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            a.image_id,
            a.measurement_id,
            a.spore_number,
            a.bbox.x,
            a.bbox.y,
            a.bbox.width,
            a.bbox.height,
            a.center.x,
            a.center.y,
            a.length_um,
            a.width_um,
            a.rotation_angle,
            a.source,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    /// Store an annotation, numbering it after the ones already on its image.
    ///
    /// Returns the new id and the assigned spore number.
    pub fn add_annotation(&mut self, annotation: &SporeAnnotation) -> Result<(i64, i64)> {
        let tx = self.conn.transaction()?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM spore_annotations WHERE image_id = ?1",
            params![annotation.image_id],
            |row| row.get(0),
        )?;
        let numbered = SporeAnnotation {
            spore_number: count + 1,
            ..annotation.clone()
        };
        let id = insert_annotation_row(&tx, &numbered)?;
        tx.commit()?;
        Ok((id, numbered.spore_number))
    }

    pub fn annotations_for_image(&self, image_id: i64) -> Result<Vec<SporeAnnotation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM spore_annotations WHERE image_id = ?1 ORDER BY spore_number, id",
            ANNOTATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![image_id], annotation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn annotation_for_measurement(&self, measurement_id: i64) -> Result<Option<SporeAnnotation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM spore_annotations WHERE measurement_id = ?1 ORDER BY id LIMIT 1",
            ANNOTATION_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![measurement_id], annotation_from_row)?;
        Ok(rows.next().transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::model::{ImageRecord, ImageType, SOURCE_MANUAL};

    fn annotation(image_id: i64) -> SporeAnnotation {
        SporeAnnotation {
            id: 0,
            image_id,
            measurement_id: None,
            spore_number: 0,
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 40.0,
                height: 30.0,
            },
            center: Point::new(30.0, 25.0),
            length_um: 9.0,
            width_um: Some(6.0),
            rotation_angle: 12.5,
            source: SOURCE_MANUAL.to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_spore_numbers_increase_per_image() {
        let mut db = Database::open_in_memory().unwrap();
        let mut image = ImageRecord::new("/a.jpg", ImageType::Microscope);
        let a = db.insert_image(&image).unwrap();
        image.filepath = PathBuf::from("/b.jpg");
        let b = db.insert_image(&image).unwrap();

        assert_eq!(db.add_annotation(&annotation(a)).unwrap().1, 1);
        assert_eq!(db.add_annotation(&annotation(a)).unwrap().1, 2);
        assert_eq!(db.add_annotation(&annotation(b)).unwrap().1, 1);

        let stored = db.annotations_for_image(a).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].spore_number, 2);
        assert_eq!(stored[0].bbox.area(), 1200.0);
    }
}
