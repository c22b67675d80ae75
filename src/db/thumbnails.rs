//! Thumbnail rows. Generation itself happens outside the store.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, Row, params};

use super::{Database, path_to_sql};
use crate::error::Result;

/// A generated thumbnail file for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub id: i64,
    pub image_id: i64,
    /// Opaque preset name such as `"224"` or `"gallery"`.
    pub size_preset: String,
    pub filepath: PathBuf,
}

pub(crate) fn thumbnail_from_row(row: &Row<'_>) -> rusqlite::Result<Thumbnail> {
    Ok(Thumbnail {
        id: row.get(0)?,
        image_id: row.get(1)?,
        size_preset: row.get(2)?,
        filepath: PathBuf::from(row.get::<_, String>(3)?),
    })
}

pub(crate) fn insert_thumbnail_row(
    conn: &Connection,
    image_id: i64,
    size_preset: &str,
    filepath: &Path,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO thumbnails (image_id, size_preset, filepath) VALUES (?1, ?2, ?3)",
        params![image_id, size_preset, path_to_sql(filepath)],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub fn add_thumbnail(&self, image_id: i64, size_preset: &str, filepath: &Path) -> Result<i64> {
        insert_thumbnail_row(&self.conn, image_id, size_preset, filepath)
    }

    pub fn thumbnails_for_image(&self, image_id: i64) -> Result<Vec<Thumbnail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, image_id, size_preset, filepath FROM thumbnails
             WHERE image_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![image_id], thumbnail_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop the rows for an image and return their paths.
    pub fn delete_thumbnails(&self, image_id: i64) -> Result<Vec<PathBuf>> {
        let paths = self
            .thumbnails_for_image(image_id)?
            .into_iter()
            .map(|t| t.filepath)
            .collect();
        self.conn
            .execute("DELETE FROM thumbnails WHERE image_id = ?1", params![image_id])?;
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_rows() {
        let db = Database::open_in_memory().unwrap();
        db.connection()
            .execute(
                "INSERT INTO images (filepath, image_type) VALUES ('/a.jpg', 'field')",
                [],
            )
            .unwrap();
        db.add_thumbnail(1, "224", Path::new("/thumbs/a_224.jpg"))
            .unwrap();
        db.add_thumbnail(1, "gallery", Path::new("/thumbs/a_g.jpg"))
            .unwrap();
        assert_eq!(db.thumbnails_for_image(1).unwrap().len(), 2);

        let removed = db.delete_thumbnails(1).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(db.thumbnails_for_image(1).unwrap().is_empty());
    }
}
