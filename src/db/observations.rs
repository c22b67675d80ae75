//! Observation rows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{Database, path_to_sql};
use crate::error::{Error, Result};
use crate::model::{Observation, ObservationDraft, SourceType};

/// Wait before retrying a contended statistics cache write.
const STATS_RETRY_DELAY: Duration = Duration::from_millis(250);

pub(crate) const OBSERVATION_COLUMNS: &str = "id, date, location, habitat, notes, genus, species, \
     species_guess, uncertain, gps_latitude, gps_longitude, author, source_type, citation, \
     data_provider, folder_path, spore_statistics, auto_threshold, auto_max_radius, created_at";

pub(crate) fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        date: row.get(1)?,
        location: row.get(2)?,
        habitat: row.get(3)?,
        notes: row.get(4)?,
        genus: row.get(5)?,
        species: row.get(6)?,
        species_guess: row.get(7)?,
        uncertain: row.get::<_, Option<bool>>(8)?.unwrap_or(false),
        gps_latitude: row.get(9)?,
        gps_longitude: row.get(10)?,
        author: row.get(11)?,
        source_type: SourceType::parse(&row.get::<_, Option<String>>(12)?.unwrap_or_default()),
        citation: row.get(13)?,
        data_provider: row.get(14)?,
        folder_path: row.get::<_, Option<String>>(15)?.map(PathBuf::from),
        spore_statistics: row.get(16)?,
        auto_threshold: row.get(17)?,
        auto_max_radius: row.get(18)?,
        created_at: row.get(19)?,
    })
}

impl Database {
    /// Insert an observation; `species_guess` is generated unless given.
    pub fn insert_observation(
        &self,
        draft: &ObservationDraft,
        folder_path: Option<&Path>,
    ) -> Result<i64> {
        if draft.date.trim().is_empty() {
            return Err(Error::invalid_input("observation date is required"));
        }
        self.conn.execute(
            "INSERT INTO observations (date, location, habitat, notes, genus, species, species_guess,
                 uncertain, gps_latitude, gps_longitude, author, source_type, citation, data_provider,
                 folder_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                draft.date,
                draft.location,
                draft.habitat,
                draft.notes,
                draft.genus,
                draft.species,
                draft.resolved_species_guess(),
                draft.uncertain,
                draft.gps_latitude,
                draft.gps_longitude,
                draft.author,
                draft.source_type.as_str(),
                draft.citation,
                draft.data_provider,
                folder_path.map(path_to_sql),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_observation(&self, id: i64) -> Result<Option<Observation>> {
        let obs = self
            .conn
            .query_row(
                &format!("SELECT {} FROM observations WHERE id = ?1", OBSERVATION_COLUMNS),
                params![id],
                observation_from_row,
            )
            .optional()?;
        Ok(obs)
    }

    /// Like [`get_observation`](Self::get_observation) but missing rows are an error.
    pub fn require_observation(&self, id: i64) -> Result<Observation> {
        self.get_observation(id)?
            .ok_or_else(|| Error::not_found("observation", id))
    }

    /// All observations, newest collection date first.
    pub fn list_observations(&self) -> Result<Vec<Observation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM observations ORDER BY date DESC, id DESC",
            OBSERVATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], observation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Overwrite the editable fields of an observation.
    ///
    /// Does not touch the folder or image paths; see
    /// [`Workbench::update_observation`](crate::Workbench::update_observation).
    pub fn update_observation_fields(&self, id: i64, draft: &ObservationDraft) -> Result<()> {
        write_fields(&self.conn, id, draft)
    }

    /// Update observation fields, folder and every image path in one transaction.
    pub fn update_observation_with_paths(
        &mut self,
        id: i64,
        draft: &ObservationDraft,
        folder_path: Option<&Path>,
        image_paths: &[ImagePaths],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        write_fields(&tx, id, draft)?;
        tx.execute(
            "UPDATE observations SET folder_path = ?1 WHERE id = ?2",
            params![folder_path.map(path_to_sql), id],
        )?;
        for paths in image_paths {
            tx.execute(
                "UPDATE images SET filepath = ?1, original_filepath = ?2 WHERE id = ?3",
                params![
                    path_to_sql(&paths.filepath),
                    paths.original_filepath.as_deref().map(path_to_sql),
                    paths.image_id
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_observation_folder(&self, id: i64, folder_path: Option<&Path>) -> Result<()> {
        self.conn.execute(
            "UPDATE observations SET folder_path = ?1 WHERE id = ?2",
            params![folder_path.map(path_to_sql), id],
        )?;
        Ok(())
    }

    pub fn set_auto_threshold(&self, id: i64, threshold: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE observations SET auto_threshold = ?1 WHERE id = ?2",
            params![threshold, id],
        )?;
        Ok(())
    }

    pub fn set_auto_max_radius(&self, id: i64, radius: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE observations SET auto_max_radius = ?1 WHERE id = ?2",
            params![radius, id],
        )?;
        Ok(())
    }

    /// Store the cached literature string.
    ///
    /// The cache is best-effort: one retry after a short wait on lock
    /// contention, then the failure is logged and dropped.
    pub fn update_spore_statistics(&self, id: i64, summary: Option<&str>) {
        let write = || -> Result<()> {
            self.conn.execute(
                "UPDATE observations SET spore_statistics = ?1 WHERE id = ?2",
                params![summary, id],
            )?;
            Ok(())
        };
        match write() {
            Ok(()) => {}
            Err(e) if e.is_busy() => {
                std::thread::sleep(STATS_RETRY_DELAY);
                if let Err(e) = write() {
                    log::warn!("Dropped statistics cache update for observation {}: {}", id, e);
                }
            }
            Err(e) => log::warn!("Failed to cache statistics for observation {}: {}", id, e),
        }
    }

    /// Delete an observation and everything it owns in one transaction.
    ///
    /// Order: annotations via measurement, annotations via image,
    /// measurements, thumbnails, images, observation. Returns the image and
    /// thumbnail file paths that belonged to it so the caller can unlink them
    /// after commit.
    pub fn delete_observation_cascade(&mut self, id: i64) -> Result<DeletedFiles> {
        let files = self.owned_files("i.observation_id = ?1", id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM spore_annotations WHERE measurement_id IN (
                 SELECT m.id FROM measurements m JOIN images i ON i.id = m.image_id
                 WHERE i.observation_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM spore_annotations WHERE image_id IN (
                 SELECT id FROM images WHERE observation_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM measurements WHERE image_id IN (
                 SELECT id FROM images WHERE observation_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM thumbnails WHERE image_id IN (
                 SELECT id FROM images WHERE observation_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM images WHERE observation_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM observations WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(Error::not_found("observation", id));
        }
        tx.commit()?;
        Ok(files)
    }

    /// Image, original and thumbnail paths for images matching `filter`.
    pub(crate) fn owned_files(&self, filter: &str, id: i64) -> Result<DeletedFiles> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT i.filepath, i.original_filepath FROM images i WHERE {}",
            filter
        ))?;
        let mut images = Vec::new();
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (path, original) = row?;
            images.push(PathBuf::from(path));
            if let Some(original) = original {
                images.push(PathBuf::from(original));
            }
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT t.filepath FROM thumbnails t JOIN images i ON i.id = t.image_id WHERE {}",
            filter
        ))?;
        let thumbnails = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .map(|r| r.map(PathBuf::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(DeletedFiles { images, thumbnails })
    }
}

/// New file locations for one image after its folder moved.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePaths {
    pub image_id: i64,
    pub filepath: PathBuf,
    pub original_filepath: Option<PathBuf>,
}

/// Files that belonged to deleted rows.
#[derive(Debug, Default, Clone)]
pub struct DeletedFiles {
    pub images: Vec<PathBuf>,
    pub thumbnails: Vec<PathBuf>,
}

/// Overwrite the editable observation columns on `conn`.
fn write_fields(conn: &Connection, id: i64, draft: &ObservationDraft) -> Result<()> {
    let changed = conn.execute(
        "UPDATE observations SET date = ?1, location = ?2, habitat = ?3, notes = ?4, genus = ?5,
             species = ?6, species_guess = ?7, uncertain = ?8, gps_latitude = ?9,
             gps_longitude = ?10, author = ?11, source_type = ?12, citation = ?13,
             data_provider = ?14
         WHERE id = ?15",
        params![
            draft.date,
            draft.location,
            draft.habitat,
            draft.notes,
            draft.genus,
            draft.species,
            draft.resolved_species_guess(),
            draft.uncertain,
            draft.gps_latitude,
            draft.gps_longitude,
            draft.author,
            draft.source_type.as_str(),
            draft.citation,
            draft.data_provider,
            id,
        ],
    )?;
    if changed == 0 {
        return Err(Error::not_found("observation", id));
    }
    Ok(())
}
