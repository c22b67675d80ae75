use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{
    BundleRoots, CALIBRATIONS_DIR, DB_ENTRY, EXTERNAL_DIR, IMAGES_DIR, IncludeFlags,
    REFERENCE_ENTRY, Reporter, archive_name,
};
use crate::db::Database;
use crate::error::Result;
use crate::reference::ReferenceStore;

/// Counts of what went into a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportSummary {
    pub observations: usize,
    pub images: usize,
    pub measurements: usize,
    pub annotations: usize,
    pub calibrations: usize,
    pub reference_values: usize,
    /// Files packed next to the databases.
    pub files: usize,
    /// Referenced files that were not on disk.
    pub missing_files: Vec<PathBuf>,
}

/// Files to pack, keyed by unique member name.
#[derive(Default)]
struct Members {
    names: HashSet<String>,
    files: Vec<(String, PathBuf)>,
    missing: Vec<PathBuf>,
}

impl Members {
    /// Queue `path` under `name`; returns `false` when the file is missing.
    fn add(&mut self, name: &str, path: &Path) -> bool {
        if !path.is_file() {
            log::warn!("Bundled row points at missing file {:?}", path);
            self.missing.push(path.to_path_buf());
            return false;
        }
        if self.names.insert(name.to_string()) {
            self.files.push((name.to_string(), path.to_path_buf()));
        }
        true
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string())
}

/// Member name for an image file: its place under the images root, or a
/// per-row name under `_external`.
fn image_member(images_root: &Path, id: i64, tag: &str, path: &Path) -> String {
    match path.strip_prefix(images_root) {
        Ok(rel) => archive_name(IMAGES_DIR, rel),
        Err(_) => archive_name(
            IMAGES_DIR,
            &Path::new(EXTERNAL_DIR).join(format!("{}{}_{}", id, tag, file_name(path))),
        ),
    }
}

/// Drop excluded entities from the staged copy.
fn prune(conn: &Connection, flags: IncludeFlags) -> Result<()> {
    conn.execute("DELETE FROM thumbnails", [])?;
    if !flags.measurements {
        conn.execute_batch("DELETE FROM spore_annotations; DELETE FROM measurements;")?;
    }
    if !flags.images {
        conn.execute_batch("DELETE FROM spore_annotations; DELETE FROM images;")?;
    }
    if !flags.observations {
        conn.execute_batch("UPDATE images SET observation_id = NULL; DELETE FROM observations;")?;
    }
    if !flags.calibrations {
        conn.execute_batch("UPDATE images SET calibration_id = NULL; DELETE FROM calibrations;")?;
    }
    Ok(())
}

/// Point every stored path at its archive member and collect the files.
fn rewrite_paths(conn: &Connection, roots: &BundleRoots) -> Result<Members> {
    let mut members = Members::default();

    let images: Vec<(i64, String, Option<String>)> = {
        let mut stmt =
            conn.prepare("SELECT id, filepath, original_filepath FROM images ORDER BY id")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<_, _>>()?
    };
    for (id, filepath, original) in images {
        let path = PathBuf::from(&filepath);
        let name = image_member(&roots.images, id, "", &path);
        members.add(&name, &path);
        let original_name = original.and_then(|o| {
            let path = PathBuf::from(o);
            let name = image_member(&roots.images, id, "_original", &path);
            members.add(&name, &path).then_some(name)
        });
        conn.execute(
            "UPDATE images SET filepath = ?1, original_filepath = ?2 WHERE id = ?3",
            params![name, original_name, id],
        )?;
    }

    let calibrations: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, image_filepath FROM calibrations WHERE image_filepath IS NOT NULL ORDER BY id",
        )?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?
    };
    for (id, filepath) in calibrations {
        let path = PathBuf::from(filepath);
        let name = archive_name(
            CALIBRATIONS_DIR,
            Path::new(&format!("{}_{}", id, file_name(&path))),
        );
        let kept = members.add(&name, &path).then_some(name);
        conn.execute(
            "UPDATE calibrations SET image_filepath = ?1 WHERE id = ?2",
            params![kept, id],
        )?;
    }

    let folders: Vec<(i64, String)> = {
        let mut stmt = conn
            .prepare("SELECT id, folder_path FROM observations WHERE folder_path IS NOT NULL")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?
    };
    for (id, folder) in folders {
        let relative = Path::new(&folder)
            .strip_prefix(&roots.images)
            .ok()
            .map(|rel| archive_name(IMAGES_DIR, rel));
        conn.execute(
            "UPDATE observations SET folder_path = ?1 WHERE id = ?2",
            params![relative, id],
        )?;
    }

    Ok(members)
}

fn count(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
    Ok(usize::try_from(n).unwrap_or_default())
}

fn add_member(
    zip: &mut ZipWriter<File>,
    name: &str,
    source: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    zip.start_file(name, options)?;
    let mut file = File::open(source)?;
    io::copy(&mut file, zip)?;
    Ok(())
}

fn write_archive(
    zip_path: &Path,
    staged_db: &Path,
    staged_references: Option<&Path>,
    members: &Members,
    reporter: &mut Reporter<'_>,
) -> Result<()> {
    if let Some(parent) = zip_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(File::create(zip_path)?);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    add_member(&mut zip, DB_ENTRY, staged_db, deflated)?;
    if let Some(references) = staged_references {
        add_member(&mut zip, REFERENCE_ENTRY, references, deflated)?;
    }

    let total = members.files.len();
    for (i, (name, source)) in members.files.iter().enumerate() {
        reporter.report(&format!("Packing {}", name), i + 1, total);
        add_member(&mut zip, name, source, stored)?;
        reporter.checkpoint()?;
    }
    zip.finish()?;
    Ok(())
}

/// Write the selected entities and their files to `zip_path`.
///
/// The live stores are never modified: a compacted copy is pruned and its
/// paths rewritten before packing. A partially written archive is removed
/// on failure or cancellation.
pub fn export_bundle(
    db: &Database,
    references: Option<&ReferenceStore>,
    roots: &BundleRoots,
    zip_path: &Path,
    flags: IncludeFlags,
    reporter: &mut Reporter<'_>,
) -> Result<ExportSummary> {
    let flags = flags.normalized();
    log::info!("Exporting bundle to {:?} with {:?}", zip_path, flags);
    reporter.report("Copying database", 0, 1);

    let staging = tempfile::tempdir()?;
    let staged_db = staging.path().join(DB_ENTRY);
    db.copy_to(&staged_db)?;

    let mut summary = ExportSummary::default();
    let members = {
        let mut conn = Connection::open(&staged_db)?;
        let tx = conn.transaction()?;
        prune(&tx, flags)?;
        let members = rewrite_paths(&tx, roots)?;
        tx.commit()?;
        summary.observations = count(&conn, "observations")?;
        summary.images = count(&conn, "images")?;
        summary.measurements = count(&conn, "measurements")?;
        summary.annotations = count(&conn, "spore_annotations")?;
        summary.calibrations = count(&conn, "calibrations")?;
        members
    };

    let staged_references = match references.filter(|_| flags.reference_values) {
        Some(store) => {
            let path = staging.path().join(REFERENCE_ENTRY);
            store.copy_to(&path)?;
            summary.reference_values = usize::try_from(store.count()?).unwrap_or_default();
            Some(path)
        }
        None => None,
    };

    if let Err(e) = write_archive(
        zip_path,
        &staged_db,
        staged_references.as_deref(),
        &members,
        reporter,
    ) {
        if let Err(remove) = fs::remove_file(zip_path) {
            log::debug!("Could not remove partial bundle {:?}: {}", zip_path, remove);
        }
        return Err(e);
    }

    summary.files = members.files.len();
    summary.missing_files = members.missing;
    log::info!(
        "Bundle written: {} observations, {} images, {} measurements, {} files",
        summary.observations,
        summary.images,
        summary.measurements,
        summary.files
    );
    Ok(summary)
}
