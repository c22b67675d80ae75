use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{Connection, params};
use serde::Serialize;
use zip::ZipArchive;

use super::{
    BundleRoots, CALIBRATIONS_DIR, DB_ENTRY, IMAGES_DIR, IncludeFlags, REFERENCE_ENTRY, Reporter,
    TableRows, insert_row, integer_value, member_destination, text_value,
};
use crate::catalog::uniquify_path;
use crate::db::{Database, path_to_sql};
use crate::error::{Error, Result};
use crate::reference::ReferenceStore;

/// Archive directory for thumbnail files written by other producers.
const THUMBNAILS_DIR: &str = "thumbnails";

/// A bundled row that was not imported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub table: &'static str,
    /// Row id inside the bundle.
    pub source_id: i64,
    pub reason: String,
}

/// Counts of imported rows per entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportSummary {
    pub observations: usize,
    pub images: usize,
    pub measurements: usize,
    pub annotations: usize,
    pub thumbnails: usize,
    pub calibrations: usize,
    pub reference_values: usize,
    pub files_copied: usize,
    pub skipped: Vec<SkippedRow>,
}

impl ImportSummary {
    fn skip(&mut self, table: &'static str, source_id: i64, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Skipping bundled {} row {}: {}", table, source_id, reason);
        self.skipped.push(SkippedRow {
            table,
            source_id,
            reason,
        });
    }
}

/// Bundle id to destination id, per entity.
#[derive(Debug, Default)]
struct IdMaps {
    observations: HashMap<i64, i64>,
    calibrations: HashMap<i64, i64>,
    images: HashMap<i64, i64>,
    measurements: HashMap<i64, i64>,
}

/// Point a foreign key at its destination row, or NULL when that row was
/// not imported. Returns whether the key resolved.
fn remap(value: &mut Value, map: &HashMap<i64, i64>) -> bool {
    match integer_value(value).and_then(|old| map.get(&old)) {
        Some(&new) => {
            *value = Value::Integer(new);
            true
        }
        None => {
            *value = Value::Null;
            false
        }
    }
}

/// Files copied by the current batch, removed again if it fails.
struct CopiedFiles {
    staging: PathBuf,
    files: Vec<PathBuf>,
}

impl CopiedFiles {
    fn new(staging: &Path) -> Self {
        Self {
            staging: staging.to_path_buf(),
            files: Vec::new(),
        }
    }

    /// Copy archive member `name` (under `prefix`) into `root`, uniquifying
    /// on collision. `None` when the member is absent or malformed.
    fn copy(&mut self, name: &str, prefix: &str, root: &Path) -> Result<Option<PathBuf>> {
        let Some(dest) = member_destination(root, prefix, name) else {
            return Ok(None);
        };
        let source = self.staging.join(name);
        if !source.is_file() {
            return Ok(None);
        }
        let dest = uniquify_path(&dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest)?;
        log::trace!("Copied {} to {:?}", name, dest);
        self.files.push(dest.clone());
        Ok(Some(dest))
    }

    fn discard(self) {
        for file in self.files {
            if let Err(e) = fs::remove_file(&file) {
                log::debug!("Could not remove {:?}: {}", file, e);
            }
        }
    }
}

/// Run one file-copying batch, removing its files when it fails.
fn with_files<T>(
    staging: &Path,
    batch: impl FnOnce(&mut CopiedFiles) -> Result<T>,
) -> Result<(T, usize)> {
    let mut copied = CopiedFiles::new(staging);
    match batch(&mut copied) {
        Ok(value) => Ok((value, copied.files.len())),
        Err(e) => {
            copied.discard();
            Err(e)
        }
    }
}

fn path_value(path: Option<PathBuf>) -> Value {
    path.map(|p| Value::Text(path_to_sql(&p)))
        .unwrap_or(Value::Null)
}

fn import_observations(
    source: &Connection,
    dest: &mut Connection,
    roots: &BundleRoots,
    ids: &mut IdMaps,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "observations")?;
    let folder = table.index("folder_path");
    for (old_id, values) in &mut table.rows {
        if let Some(i) = folder {
            let resolved = text_value(&values[i])
                .and_then(|name| member_destination(&roots.images, IMAGES_DIR, name));
            values[i] = path_value(resolved);
        }
        let new_id = insert_row(&tx, "observations", &table.columns, values)?;
        ids.observations.insert(*old_id, new_id);
    }
    tx.commit()?;
    Ok(table.len())
}

fn import_calibrations(
    source: &Connection,
    dest: &mut Connection,
    roots: &BundleRoots,
    copied: &mut CopiedFiles,
    ids: &mut IdMaps,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "calibrations")?;
    let image = table.index("image_filepath");
    let active = table.index("is_active");
    let key = table.index("objective_key");
    for (old_id, values) in &mut table.rows {
        if let Some(i) = image {
            let stored = match text_value(&values[i]) {
                Some(name) => copied.copy(name, CALIBRATIONS_DIR, &roots.calibrations)?,
                None => None,
            };
            values[i] = path_value(stored);
        }
        if let (Some(a), Some(k)) = (active, key) {
            if integer_value(&values[a]) == Some(1) {
                let has_active: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM calibrations WHERE objective_key = ?1 AND is_active = 1)",
                    params![text_value(&values[k])],
                    |row| row.get(0),
                )?;
                if has_active {
                    log::info!(
                        "Bundled calibration {} imported inactive, destination already has an active one",
                        old_id
                    );
                    values[a] = Value::Integer(0);
                }
            }
        }
        let new_id = insert_row(&tx, "calibrations", &table.columns, values)?;
        ids.calibrations.insert(*old_id, new_id);
    }
    tx.commit()?;
    Ok(table.len())
}

fn import_images(
    source: &Connection,
    dest: &mut Connection,
    roots: &BundleRoots,
    copied: &mut CopiedFiles,
    ids: &mut IdMaps,
    summary: &mut ImportSummary,
    reporter: &mut Reporter<'_>,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "images")?;
    let (Some(filepath), observation, calibration, original) = (
        table.index("filepath"),
        table.index("observation_id"),
        table.index("calibration_id"),
        table.index("original_filepath"),
    ) else {
        return Ok(0);
    };

    let total = table.len();
    let mut imported = 0;
    for (n, (old_id, values)) in table.rows.iter_mut().enumerate() {
        reporter.report("Importing images", n + 1, total);
        let file = match text_value(&values[filepath]) {
            Some(name) => copied.copy(name, IMAGES_DIR, &roots.images)?,
            None => None,
        };
        let Some(file) = file else {
            summary.skip("images", *old_id, "image file missing from bundle");
            continue;
        };
        values[filepath] = path_value(Some(file));
        if let Some(i) = original {
            let kept = match text_value(&values[i]) {
                Some(name) => copied.copy(name, IMAGES_DIR, &roots.images)?,
                None => None,
            };
            values[i] = path_value(kept);
        }
        if let Some(i) = observation {
            remap(&mut values[i], &ids.observations);
        }
        if let Some(i) = calibration {
            remap(&mut values[i], &ids.calibrations);
        }
        let new_id = insert_row(&tx, "images", &table.columns, values)?;
        ids.images.insert(*old_id, new_id);
        imported += 1;
        reporter.checkpoint()?;
    }
    tx.commit()?;
    Ok(imported)
}

fn import_measurements(
    source: &Connection,
    dest: &mut Connection,
    ids: &mut IdMaps,
    summary: &mut ImportSummary,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "measurements")?;
    let Some(image) = table.index("image_id") else {
        return Ok(0);
    };
    let mut imported = 0;
    for (old_id, values) in &mut table.rows {
        if !remap(&mut values[image], &ids.images) {
            summary.skip("measurements", *old_id, "image not imported");
            continue;
        }
        let new_id = insert_row(&tx, "measurements", &table.columns, values)?;
        ids.measurements.insert(*old_id, new_id);
        imported += 1;
    }
    tx.commit()?;
    Ok(imported)
}

fn import_annotations(
    source: &Connection,
    dest: &mut Connection,
    ids: &IdMaps,
    summary: &mut ImportSummary,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "spore_annotations")?;
    let Some(image) = table.index("image_id") else {
        return Ok(0);
    };
    let measurement = table.index("measurement_id");
    let mut imported = 0;
    for (old_id, values) in &mut table.rows {
        if !remap(&mut values[image], &ids.images) {
            summary.skip("spore_annotations", *old_id, "image not imported");
            continue;
        }
        if let Some(i) = measurement {
            remap(&mut values[i], &ids.measurements);
        }
        insert_row(&tx, "spore_annotations", &table.columns, values)?;
        imported += 1;
    }
    tx.commit()?;
    Ok(imported)
}

/// Thumbnail rows travel only when their file is in the archive.
fn import_thumbnails(
    source: &Connection,
    dest: &mut Connection,
    roots: &BundleRoots,
    copied: &mut CopiedFiles,
    ids: &IdMaps,
) -> Result<usize> {
    let tx = dest.transaction()?;
    let mut table = TableRows::read(source, &tx, "thumbnails")?;
    let (Some(image), Some(filepath)) = (table.index("image_id"), table.index("filepath")) else {
        return Ok(0);
    };
    let mut imported = 0;
    for (_, values) in &mut table.rows {
        if !remap(&mut values[image], &ids.images) {
            continue;
        }
        let file = match text_value(&values[filepath]) {
            Some(name) => copied.copy(name, THUMBNAILS_DIR, &roots.thumbnails)?,
            None => None,
        };
        let Some(file) = file else { continue };
        values[filepath] = path_value(Some(file));
        insert_row(&tx, "thumbnails", &table.columns, values)?;
        imported += 1;
    }
    tx.commit()?;
    Ok(imported)
}

/// Merge a bundle into the destination stores.
///
/// Rows get fresh ids and their foreign keys are rewritten. Files are copied
/// under the destination roots at the same relative location, uniquified on
/// collision. Each entity is inserted in its own transaction; a failing or
/// cancelled batch leaves no rows or copied files behind, while batches that
/// already committed stay.
pub fn import_bundle(
    db: &mut Database,
    references: Option<&mut ReferenceStore>,
    roots: &BundleRoots,
    zip_path: &Path,
    flags: IncludeFlags,
    reporter: &mut Reporter<'_>,
) -> Result<ImportSummary> {
    let flags = flags.normalized();
    if !zip_path.is_file() {
        return Err(Error::FileNotFound {
            path: zip_path.to_path_buf(),
        });
    }
    log::info!("Importing bundle {:?} with {:?}", zip_path, flags);

    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    if !archive.file_names().any(|name| name == DB_ENTRY) {
        return Err(Error::MissingBundleEntry {
            name: DB_ENTRY.to_string(),
        });
    }
    reporter.report("Extracting bundle", 0, 1);
    let staging = tempfile::tempdir()?;
    archive.extract(staging.path())?;

    let bundled = Database::open_read_only(&staging.path().join(DB_ENTRY))?;
    let source = bundled.connection();
    let dest = db.connection_mut();
    let mut ids = IdMaps::default();
    let mut summary = ImportSummary::default();

    if flags.observations {
        reporter.report("Importing observations", 0, 1);
        summary.observations = import_observations(source, dest, roots, &mut ids)?;
    }
    if flags.calibrations {
        reporter.report("Importing calibrations", 0, 1);
        let (count, files) = with_files(staging.path(), |copied| {
            import_calibrations(source, dest, roots, copied, &mut ids)
        })?;
        summary.calibrations = count;
        summary.files_copied += files;
    }
    if flags.images {
        let (count, files) = with_files(staging.path(), |copied| {
            import_images(source, dest, roots, copied, &mut ids, &mut summary, reporter)
        })?;
        summary.images = count;
        summary.files_copied += files;

        let (count, files) = with_files(staging.path(), |copied| {
            import_thumbnails(source, dest, roots, copied, &ids)
        })?;
        summary.thumbnails = count;
        summary.files_copied += files;
    }
    if flags.measurements {
        reporter.report("Importing measurements", 0, 1);
        let measurements = import_measurements(source, dest, &mut ids, &mut summary)?;
        let annotations = import_annotations(source, dest, &ids, &mut summary)?;
        summary.measurements = measurements;
        summary.annotations = annotations;
    }

    let reference_db = staging.path().join(REFERENCE_ENTRY);
    if flags.reference_values && reference_db.is_file() {
        if let Some(store) = references {
            reporter.report("Importing reference values", 0, 1);
            let rows = ReferenceStore::open_read_only(&reference_db)?.list_all()?;
            summary.reference_values = store.upsert_many(&rows)?;
        }
    }

    log::info!(
        "Bundle imported: {} observations, {} images, {} measurements, {} calibrations, {} skipped",
        summary.observations,
        summary.images,
        summary.measurements,
        summary.calibrations,
        summary.skipped.len()
    );
    Ok(summary)
}
