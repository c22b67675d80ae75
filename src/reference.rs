//! Literature reference values, kept in their own database file.
//!
//! Rows are unique by (genus, species, source, mount medium) with NULL
//! matching NULL. An upsert replaces the matching row in one transaction.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Row, Transaction, params};

use crate::db::now_timestamp;
use crate::error::{Error, Result};
use crate::model::{Measurement, ReferenceValues};
use crate::stats::{Distribution, SporeStatistics};

const REFERENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reference_values (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    genus           TEXT NOT NULL,
    species         TEXT NOT NULL,
    source          TEXT,
    mount_medium    TEXT,
    length_min      REAL,
    length_p05      REAL,
    length_p50      REAL,
    length_p95      REAL,
    length_max      REAL,
    length_avg      REAL,
    width_min       REAL,
    width_p05       REAL,
    width_p50       REAL,
    width_p95       REAL,
    width_max       REAL,
    width_avg       REAL,
    q_min           REAL,
    q_p50           REAL,
    q_max           REAL,
    q_avg           REAL,
    updated_at      TEXT
);
CREATE INDEX IF NOT EXISTS idx_reference_species ON reference_values(genus, species);
"#;

const COLUMNS: &str = "id, genus, species, source, mount_medium, length_min, length_p05, \
     length_p50, length_p95, length_max, length_avg, width_min, width_p05, width_p50, width_p95, \
     width_max, width_avg, q_min, q_p50, q_max, q_avg, updated_at";

fn reference_from_row(row: &Row<'_>) -> rusqlite::Result<ReferenceValues> {
    Ok(ReferenceValues {
        id: row.get(0)?,
        genus: row.get(1)?,
        species: row.get(2)?,
        source: row.get(3)?,
        mount_medium: row.get(4)?,
        length_min: row.get(5)?,
        length_p05: row.get(6)?,
        length_p50: row.get(7)?,
        length_p95: row.get(8)?,
        length_max: row.get(9)?,
        length_avg: row.get(10)?,
        width_min: row.get(11)?,
        width_p05: row.get(12)?,
        width_p50: row.get(13)?,
        width_p95: row.get(14)?,
        width_max: row.get(15)?,
        width_avg: row.get(16)?,
        q_min: row.get(17)?,
        q_p50: row.get(18)?,
        q_max: row.get(19)?,
        q_avg: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn blank_to_none(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn upsert_in(tx: &Transaction<'_>, values: &ReferenceValues) -> Result<i64> {
    let genus = values.genus.trim();
    let species = values.species.trim();
    if genus.is_empty() || species.is_empty() {
        return Err(Error::invalid_input("reference values need genus and species"));
    }
    let source = blank_to_none(&values.source);
    let mount = blank_to_none(&values.mount_medium);
    let updated_at = values.updated_at.clone().unwrap_or_else(now_timestamp);

    tx.execute(
        "DELETE FROM reference_values
         WHERE genus = ?1 AND species = ?2 AND source IS ?3 AND mount_medium IS ?4",
        params![genus, species, source, mount],
    )?;
    tx.execute(
        "INSERT INTO reference_values (genus, species, source, mount_medium,
             length_min, length_p05, length_p50, length_p95, length_max, length_avg,
             width_min, width_p05, width_p50, width_p95, width_max, width_avg,
             q_min, q_p50, q_max, q_avg, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21)",
        params![
            genus,
            species,
            source,
            mount,
            values.length_min,
            values.length_p05,
            values.length_p50,
            values.length_p95,
            values.length_max,
            values.length_avg,
            values.width_min,
            values.width_p05,
            values.width_p50,
            values.width_p95,
            values.width_max,
            values.width_avg,
            values.q_min,
            values.q_p50,
            values.q_max,
            values.q_avg,
            updated_at,
        ],
    )?;
    let id = tx.last_insert_rowid();
    log::debug!("Reference values for {} {} stored as {}", genus, species, id);
    Ok(id)
}

/// The reference values store (`reference_values.db`).
pub struct ReferenceStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl ReferenceStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(REFERENCE_SCHEMA)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(REFERENCE_SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write a compacted copy of the store to `dest`.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        self.conn
            .execute("VACUUM INTO ?1", [dest.to_string_lossy().as_ref()])?;
        Ok(())
    }

    /// Replace the row with the same key, returning the new id.
    pub fn upsert(&mut self, values: &ReferenceValues) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let id = upsert_in(&tx, values)?;
        tx.commit()?;
        Ok(id)
    }

    /// Upsert every row in one transaction; returns how many were stored.
    pub fn upsert_many(&mut self, rows: &[ReferenceValues]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        for values in rows {
            upsert_in(&tx, values)?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Rows for a species, newest first; `source` narrows when given.
    fn candidates(
        &self,
        genus: &str,
        species: &str,
        source: Option<&str>,
    ) -> Result<Vec<ReferenceValues>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM reference_values
             WHERE genus = ?1 AND species = ?2 AND (?3 IS NULL OR source = ?3)
             ORDER BY updated_at DESC, id DESC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![genus, species, source], reference_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Most recent values for a species.
    ///
    /// Without a mount medium, a row stored without one wins; otherwise the
    /// row is returned only when a single mount medium exists.
    pub fn get(
        &self,
        genus: &str,
        species: &str,
        source: Option<&str>,
        mount_medium: Option<&str>,
    ) -> Result<Option<ReferenceValues>> {
        let rows = self.candidates(genus, species, source)?;
        if let Some(mount) = mount_medium {
            return Ok(rows
                .into_iter()
                .find(|r| r.mount_medium.as_deref() == Some(mount)));
        }
        if let Some(pos) = rows.iter().position(|r| r.mount_medium.is_none()) {
            return Ok(rows.into_iter().nth(pos));
        }
        let first_mount = rows.first().and_then(|r| r.mount_medium.clone());
        if rows.iter().all(|r| r.mount_medium == first_mount) {
            return Ok(rows.into_iter().next());
        }
        Ok(None)
    }

    /// Every row, in id order.
    pub fn list_all(&self) -> Result<Vec<ReferenceValues>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM reference_values ORDER BY id", COLUMNS))?;
        let rows = stmt
            .query_map([], reference_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM reference_values", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM reference_values WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn distinct(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn like_prefix(prefix: Option<&str>) -> String {
        let escaped = prefix
            .unwrap_or("")
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("{}%", escaped)
    }

    pub fn genera(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let pattern = Self::like_prefix(prefix);
        self.distinct(
            "SELECT DISTINCT genus FROM reference_values
             WHERE genus LIKE ?1 ESCAPE '\\' ORDER BY genus",
            &[&pattern],
        )
    }

    pub fn species(&self, genus: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let pattern = Self::like_prefix(prefix);
        self.distinct(
            "SELECT DISTINCT species FROM reference_values
             WHERE genus = ?1 AND species LIKE ?2 ESCAPE '\\' ORDER BY species",
            &[&genus, &pattern],
        )
    }

    pub fn sources(&self, genus: &str, species: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        let pattern = Self::like_prefix(prefix);
        self.distinct(
            "SELECT DISTINCT source FROM reference_values
             WHERE genus = ?1 AND species = ?2 AND source IS NOT NULL
                 AND source LIKE ?3 ESCAPE '\\'
             ORDER BY source",
            &[&genus, &species, &pattern],
        )
    }

    pub fn mount_mediums(
        &self,
        genus: &str,
        species: &str,
        source: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<Vec<String>> {
        let pattern = Self::like_prefix(prefix);
        self.distinct(
            "SELECT DISTINCT mount_medium FROM reference_values
             WHERE genus = ?1 AND species = ?2 AND (?3 IS NULL OR source = ?3)
                 AND mount_medium IS NOT NULL AND mount_medium LIKE ?4 ESCAPE '\\'
             ORDER BY mount_medium",
            &[&genus, &species, &source, &pattern],
        )
    }
}

impl std::fmt::Debug for ReferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStore")
            .field("path", &self.path)
            .finish()
    }
}

impl ReferenceValues {
    /// Summarize measured spores into a reference row.
    ///
    /// Returns `None` when there are no spore measurements.
    pub fn from_measurements<'a, I>(genus: &str, species: &str, measurements: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Measurement>,
    {
        let stats = SporeStatistics::from_measurements(measurements)?;
        let mut values = ReferenceValues::new(genus, species);
        let l = stats.length;
        values.length_min = Some(l.min);
        values.length_p05 = Some(l.p5);
        values.length_p50 = Some(l.p50);
        values.length_p95 = Some(l.p95);
        values.length_max = Some(l.max);
        values.length_avg = Some(l.mean);
        if let Some(w) = stats.width {
            values.width_min = Some(w.min);
            values.width_p05 = Some(w.p5);
            values.width_p50 = Some(w.p50);
            values.width_p95 = Some(w.p95);
            values.width_max = Some(w.max);
            values.width_avg = Some(w.mean);
        }
        if let Some(Distribution {
            min, p50, max, mean, ..
        }) = stats.q
        {
            values.q_min = Some(min);
            values.q_p50 = Some(p50);
            values.q_max = Some(max);
            values.q_avg = Some(mean);
        }
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amanita(length_min: f64) -> ReferenceValues {
        let mut v = ReferenceValues::new("Amanita", "muscaria").with_source("Funga Nordica");
        v.length_min = Some(length_min);
        v.length_max = Some(9.0);
        v
    }

    #[test]
    fn test_upsert_replaces_matching_key() {
        let mut store = ReferenceStore::open_in_memory().unwrap();
        store.upsert(&amanita(7.0)).unwrap();
        store.upsert(&amanita(7.5)).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        let row = store
            .get("Amanita", "muscaria", Some("Funga Nordica"), None)
            .unwrap()
            .unwrap();
        assert_eq!(row.length_min, Some(7.5));
        assert!(row.has_minmax());

        store.upsert(&amanita(8.0).with_mount("KOH")).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_get_with_single_mount() {
        let mut store = ReferenceStore::open_in_memory().unwrap();
        store.upsert(&amanita(7.0).with_mount("Water")).unwrap();
        let row = store.get("Amanita", "muscaria", None, None).unwrap().unwrap();
        assert_eq!(row.mount_medium.as_deref(), Some("Water"));

        store.upsert(&amanita(7.2).with_mount("KOH")).unwrap();
        assert!(store.get("Amanita", "muscaria", None, None).unwrap().is_none());
        let koh = store
            .get("Amanita", "muscaria", None, Some("KOH"))
            .unwrap()
            .unwrap();
        assert_eq!(koh.length_min, Some(7.2));
    }

    #[test]
    fn test_listing_with_prefix() {
        let mut store = ReferenceStore::open_in_memory().unwrap();
        store.upsert(&amanita(7.0).with_mount("Water")).unwrap();
        store
            .upsert(&ReferenceValues::new("Agaricus", "campestris").with_source("Breitenbach"))
            .unwrap();
        store
            .upsert(&ReferenceValues::new("Boletus", "edulis"))
            .unwrap();

        assert_eq!(
            store.genera(Some("A")).unwrap(),
            vec!["Agaricus".to_string(), "Amanita".to_string()]
        );
        assert_eq!(store.genera(None).unwrap().len(), 3);
        assert_eq!(store.species("Amanita", Some("mus")).unwrap(), vec!["muscaria"]);
        assert_eq!(
            store.sources("Amanita", "muscaria", None).unwrap(),
            vec!["Funga Nordica"]
        );
        assert_eq!(
            store.mount_mediums("Amanita", "muscaria", None, None).unwrap(),
            vec!["Water"]
        );
        assert!(store.genera(Some("%")).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_missing_taxon() {
        let mut store = ReferenceStore::open_in_memory().unwrap();
        assert!(matches!(
            store.upsert(&ReferenceValues::new("Amanita", " ")),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_from_measurements() {
        let measurements: Vec<Measurement> = [(9.0, Some(6.0)), (10.0, Some(5.0)), (11.0, None)]
            .iter()
            .enumerate()
            .map(|(i, (l, w))| Measurement {
                id: i as i64 + 1,
                image_id: 1,
                length_um: *l,
                width_um: *w,
                measurement_type: "spores".into(),
                notes: None,
                points: [None; 4],
                gallery_rotation: None,
                measured_at: String::new(),
            })
            .collect();
        let values =
            ReferenceValues::from_measurements("Amanita", "muscaria", &measurements).unwrap();
        assert_eq!(values.length_min, Some(9.0));
        assert_eq!(values.length_max, Some(11.0));
        assert_eq!(values.length_p50, Some(10.0));
        assert_eq!(values.width_max, Some(6.0));
        assert_eq!(values.q_max, Some(2.0));
        assert!(ReferenceValues::from_measurements("A", "b", &[]).is_none());
    }
}
