//! Schema bootstrap and migrations for the main store.
//!
//! Base tables are created with `IF NOT EXISTS`; columns introduced later
//! are added by diffing `PRAGMA table_info` against [`COLUMN_ADDITIONS`].
//! Running [`initialize`] repeatedly is a no-op.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, params};

use crate::error::Result;

/// Base tables as first released.
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    date            TEXT NOT NULL,
    location        TEXT,
    habitat         TEXT,
    notes           TEXT,
    genus           TEXT,
    species         TEXT,
    species_guess   TEXT,
    folder_path     TEXT,
    created_at      TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS images (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    observation_id          INTEGER REFERENCES observations(id),
    filepath                TEXT NOT NULL,
    image_type              TEXT NOT NULL DEFAULT 'field',
    micro_category          TEXT,
    objective_name          TEXT,
    scale_microns_per_pixel REAL,
    mount_medium            TEXT,
    sample_type             TEXT,
    contrast                TEXT,
    notes                   TEXT,
    created_at              TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS calibrations (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    objective_key       TEXT NOT NULL,
    calibration_date    TEXT NOT NULL,
    microns_per_pixel   REAL NOT NULL,
    std_dev             REAL,
    confidence_low      REAL,
    confidence_high     REAL,
    num_measurements    INTEGER NOT NULL DEFAULT 0,
    measurements_json   TEXT,
    image_filepath      TEXT,
    notes               TEXT,
    is_active           INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS thumbnails (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id    INTEGER NOT NULL REFERENCES images(id),
    size_preset TEXT NOT NULL,
    filepath    TEXT NOT NULL,
    created_at  TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS spore_annotations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id        INTEGER NOT NULL REFERENCES images(id),
    measurement_id  INTEGER REFERENCES measurements(id),
    spore_number    INTEGER NOT NULL,
    bbox_x          REAL NOT NULL,
    bbox_y          REAL NOT NULL,
    bbox_width      REAL NOT NULL,
    bbox_height     REAL NOT NULL,
    center_x        REAL NOT NULL,
    center_y        REAL NOT NULL,
    length_um       REAL NOT NULL,
    width_um        REAL,
    rotation_angle  REAL NOT NULL DEFAULT 0,
    source          TEXT NOT NULL DEFAULT 'manual',
    created_at      TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Measurements table as first released (two points only).
const MEASUREMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS measurements (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id            INTEGER REFERENCES images(id),
    length_um           REAL NOT NULL,
    width_um            REAL,
    measurement_type    TEXT DEFAULT 'manual',
    notes               TEXT,
    p1_x                REAL,
    p1_y                REAL,
    p2_x                REAL,
    p2_y                REAL,
    measured_at         TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_images_observation ON images(observation_id);
CREATE INDEX IF NOT EXISTS idx_measurements_image ON measurements(image_id);
CREATE INDEX IF NOT EXISTS idx_calibrations_objective ON calibrations(objective_key);
CREATE INDEX IF NOT EXISTS idx_thumbnails_image ON thumbnails(image_id);
CREATE INDEX IF NOT EXISTS idx_annotations_image ON spore_annotations(image_id);
CREATE INDEX IF NOT EXISTS idx_annotations_measurement ON spore_annotations(measurement_id);
"#;

/// Columns added after the first release, per table.
pub const COLUMN_ADDITIONS: &[(&str, &[(&str, &str)])] = &[
    (
        "observations",
        &[
            ("uncertain", "INTEGER NOT NULL DEFAULT 0"),
            ("gps_latitude", "REAL"),
            ("gps_longitude", "REAL"),
            ("author", "TEXT"),
            ("source_type", "TEXT NOT NULL DEFAULT 'personal'"),
            ("citation", "TEXT"),
            ("data_provider", "TEXT"),
            ("spore_statistics", "TEXT"),
            ("auto_threshold", "REAL"),
            ("auto_max_radius", "REAL"),
        ],
    ),
    (
        "images",
        &[
            ("calibration_id", "INTEGER"),
            ("measure_color", "TEXT"),
            ("original_filepath", "TEXT"),
            ("gps_source", "INTEGER NOT NULL DEFAULT 0"),
            ("resample_scale_factor", "REAL NOT NULL DEFAULT 1.0"),
            ("crop_box_x1", "REAL"),
            ("crop_box_y1", "REAL"),
            ("crop_box_x2", "REAL"),
            ("crop_box_y2", "REAL"),
            ("crop_source_w", "INTEGER"),
            ("crop_source_h", "INTEGER"),
        ],
    ),
    (
        "measurements",
        &[
            ("p3_x", "REAL"),
            ("p3_y", "REAL"),
            ("p4_x", "REAL"),
            ("p4_y", "REAL"),
            ("gallery_rotation", "INTEGER"),
        ],
    ),
    (
        "calibrations",
        &[
            ("camera", "TEXT"),
            ("megapixels", "REAL"),
            ("target_sampling_pct", "REAL"),
            ("resample_scale_factor", "REAL"),
            ("calibration_image_width", "INTEGER"),
            ("calibration_image_height", "INTEGER"),
        ],
    ),
];

/// Create every table, migrate legacy data and add missing columns.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(BASE_SCHEMA)?;
    migrate_legacy_measurements(conn)?;
    conn.execute_batch(MEASUREMENTS_TABLE)?;
    for (table, columns) in COLUMN_ADDITIONS {
        ensure_columns(conn, table, columns)?;
    }
    conn.execute_batch(INDEXES)?;
    log::debug!("Database schema initialized");
    Ok(())
}

/// Names of the columns currently present on `table`.
pub fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// Add whichever of `columns` are missing from `table`.
///
/// Returns the names that were added.
pub fn ensure_columns(
    conn: &Connection,
    table: &str,
    columns: &[(&str, &str)],
) -> Result<Vec<String>> {
    let existing = table_columns(conn, table)?;
    let mut added = Vec::new();
    for (name, decl) in columns {
        if existing.contains(*name) {
            continue;
        }
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, name, decl),
            [],
        )?;
        log::info!("Added column {}.{}", table, name);
        added.push((*name).to_string());
    }
    Ok(added)
}

/// Rewrite the legacy measurements table keyed by `image_path`.
///
/// Legacy rows are grouped by path, one synthetic `images` row is created per
/// distinct path, and every measurement is copied into the current table shape
/// pointing at its image.
fn migrate_legacy_measurements(conn: &Connection) -> Result<()> {
    let columns = table_columns(conn, "measurements")?;
    if columns.is_empty() || columns.contains("image_id") || !columns.contains("image_path") {
        return Ok(());
    }
    log::info!("Migrating legacy measurements keyed by image_path");

    let optional = |name: &str| {
        if columns.contains(name) {
            name.to_string()
        } else {
            format!("NULL AS {}", name)
        }
    };
    let select = format!(
        "SELECT id, image_path, length_um, {}, {}, {}, {}, {}, {}, {}, {} FROM measurements ORDER BY id",
        optional("width_um"),
        optional("measurement_type"),
        optional("notes"),
        optional("p1_x"),
        optional("p1_y"),
        optional("p2_x"),
        optional("p2_y"),
        optional("measured_at"),
    );

    type LegacyRow = (
        i64,
        Option<String>,
        Option<f64>,
        Option<f64>,
        Option<String>,
        Option<String>,
        [Option<f64>; 4],
        Option<String>,
    );
    let rows: Vec<LegacyRow> = {
        let mut stmt = conn.prepare(&select)?;
        stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                [row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?],
                row.get(10)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&MEASUREMENTS_TABLE.replace("measurements (", "measurements_migrated ("))?;

    let mut image_ids: HashMap<String, i64> = HashMap::new();
    let mut migrated = 0;
    for (id, image_path, length, width, kind, notes, pts, measured_at) in &rows {
        let Some(length) = length else {
            log::warn!("Dropping legacy measurement {} without a length", id);
            continue;
        };
        let image_id = match image_path {
            Some(path) => match image_ids.get(path) {
                Some(&image_id) => Some(image_id),
                None => {
                    tx.execute(
                        "INSERT INTO images (observation_id, filepath, image_type) VALUES (NULL, ?1, 'microscope')",
                        params![path],
                    )?;
                    let image_id = tx.last_insert_rowid();
                    image_ids.insert(path.clone(), image_id);
                    Some(image_id)
                }
            },
            None => None,
        };
        tx.execute(
            "INSERT INTO measurements_migrated
                (id, image_id, length_um, width_um, measurement_type, notes, p1_x, p1_y, p2_x, p2_y, measured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, COALESCE(?11, CURRENT_TIMESTAMP))",
            params![
                id,
                image_id,
                length,
                width,
                kind,
                notes,
                pts[0],
                pts[1],
                pts[2],
                pts[3],
                measured_at
            ],
        )?;
        migrated += 1;
    }

    tx.execute_batch(
        "DROP TABLE measurements;
         ALTER TABLE measurements_migrated RENAME TO measurements;",
    )?;
    tx.commit()?;

    log::info!(
        "Migrated {} of {} legacy measurements onto {} images",
        migrated,
        rows.len(),
        image_ids.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();

        let cols = table_columns(&conn, "measurements").unwrap();
        for name in ["image_id", "p3_x", "p4_y", "gallery_rotation"] {
            assert!(cols.contains(name), "missing {}", name);
        }
        let cols = table_columns(&conn, "images").unwrap();
        assert!(cols.contains("resample_scale_factor"));
        assert!(cols.contains("calibration_id"));
    }

    #[test]
    fn test_ensure_columns_reports_additions() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)").unwrap();
        let added = ensure_columns(&conn, "t", &[("a", "TEXT"), ("b", "REAL")]).unwrap();
        assert_eq!(added, vec!["a".to_string(), "b".to_string()]);
        let added = ensure_columns(&conn, "t", &[("a", "TEXT"), ("c", "INTEGER")]).unwrap();
        assert_eq!(added, vec!["c".to_string()]);
    }

    #[test]
    fn test_legacy_measurements_are_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_path TEXT NOT NULL,
                length_um REAL NOT NULL,
                width_um REAL,
                measurement_type TEXT,
                measured_at TEXT
            );
            INSERT INTO measurements (image_path, length_um, width_um) VALUES ('/a.jpg', 10.0, 6.0);
            INSERT INTO measurements (image_path, length_um, width_um) VALUES ('/a.jpg', 11.0, 6.5);
            INSERT INTO measurements (image_path, length_um, width_um) VALUES ('/b.jpg', 9.0, NULL);",
        )
        .unwrap();

        initialize(&conn).unwrap();

        let images: i64 = conn
            .query_row("SELECT COUNT(*) FROM images", [], |r| r.get(0))
            .unwrap();
        assert_eq!(images, 2);

        let mut stmt = conn
            .prepare(
                "SELECT i.filepath, COUNT(*) FROM measurements m
                 JOIN images i ON i.id = m.image_id GROUP BY i.filepath ORDER BY i.filepath",
            )
            .unwrap();
        let grouped: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(grouped, vec![("/a.jpg".to_string(), 2), ("/b.jpg".to_string(), 1)]);

        let cols = table_columns(&conn, "measurements").unwrap();
        assert!(!cols.contains("image_path"));
        assert!(cols.contains("p4_x"));
    }

    #[test]
    fn test_legacy_rows_without_length_are_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_path TEXT,
                length_um REAL,
                width_um REAL
            );
            INSERT INTO measurements (image_path, length_um, width_um) VALUES ('/a.jpg', 10.0, 6.0);
            INSERT INTO measurements (image_path, length_um, width_um) VALUES ('/a.jpg', NULL, 6.5);",
        )
        .unwrap();

        initialize(&conn).unwrap();

        let lengths: Vec<f64> = conn
            .prepare("SELECT length_um FROM measurements ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(lengths, vec![10.0]);
    }
}
