//! Zip bundles carrying a selected subset of the stores plus image files.
//!
//! ```text
//! bundle.zip
//!   mushrooms.db
//!   reference_values.db        (optional)
//!   images/<relative path under the images root>
//!   images/_external/<id>_<name>
//!   calibrations/<id>_<name>
//! ```
//!
//! Paths inside the bundled database point at archive members, never at the
//! exporting machine's filesystem. Import rewrites them against the
//! destination roots.

mod export;
mod import;

pub use export::{ExportSummary, export_bundle};
pub use import::{ImportSummary, SkippedRow, import_bundle};

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::Connection;
use rusqlite::types::Value;

use crate::db::schema::table_columns;
use crate::error::{Error, Result};

/// Archive member holding the main store.
pub const DB_ENTRY: &str = "mushrooms.db";

/// Archive member holding the reference store.
pub const REFERENCE_ENTRY: &str = "reference_values.db";

/// Archive directory mirroring the images root.
pub const IMAGES_DIR: &str = "images";

/// Subdirectory of [`IMAGES_DIR`] for files that lived outside the images root.
pub const EXTERNAL_DIR: &str = "_external";

/// Archive directory for calibration reference images.
pub const CALIBRATIONS_DIR: &str = "calibrations";

/// Which entities a bundle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeFlags {
    pub observations: bool,
    pub images: bool,
    pub measurements: bool,
    pub calibrations: bool,
    pub reference_values: bool,
}

impl IncludeFlags {
    pub fn all() -> Self {
        Self {
            observations: true,
            images: true,
            measurements: true,
            calibrations: true,
            reference_values: true,
        }
    }

    pub fn none() -> Self {
        Self {
            observations: false,
            images: false,
            measurements: false,
            calibrations: false,
            reference_values: false,
        }
    }

    /// Measurements cannot travel without their images and observations.
    pub fn normalized(self) -> Self {
        if self.measurements {
            Self {
                observations: true,
                images: true,
                ..self
            }
        } else {
            self
        }
    }
}

impl Default for IncludeFlags {
    fn default() -> Self {
        Self::all()
    }
}

/// Destination (import) or source (export) directories for bundled files.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleRoots {
    pub images: PathBuf,
    pub calibrations: PathBuf,
    pub thumbnails: PathBuf,
}

impl BundleRoots {
    pub fn new(images: impl Into<PathBuf>, calibrations: impl Into<PathBuf>, thumbnails: impl Into<PathBuf>) -> Self {
        Self {
            images: images.into(),
            calibrations: calibrations.into(),
            thumbnails: thumbnails.into(),
        }
    }
}

/// Progress callback receiving `(text, current, total)`.
pub type ProgressFn<'a> = dyn FnMut(&str, usize, usize) + 'a;

/// Progress sink and cooperative cancel flag for long bundle operations.
#[derive(Default)]
pub struct Reporter<'a> {
    progress: Option<&'a mut ProgressFn<'a>>,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Reporter<'a> {
    /// No progress output and no cancellation.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: &'a mut ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn report(&mut self, text: &str, current: usize, total: usize) {
        log::trace!("{} ({}/{})", text, current, total);
        if let Some(progress) = self.progress.as_mut() {
            progress(text, current, total);
        }
    }

    /// Fail with [`Error::Cancelled`] once the cancel flag is raised.
    pub fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Reporter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Archive member name for a relative path, always `/`-separated.
pub(crate) fn archive_name(prefix: &str, relative: &Path) -> String {
    let mut parts = vec![prefix.to_string()];
    parts.extend(relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part.to_string_lossy().to_string()),
        _ => None,
    }));
    parts.join("/")
}

/// Resolve an archive member name under `root`, dropping the leading
/// `prefix` directory. Returns `None` for names outside `prefix` or
/// containing parent references.
pub(crate) fn member_destination(root: &Path, prefix: &str, name: &str) -> Option<PathBuf> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut dest = root.to_path_buf();
    for part in rest.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => dest.push(part),
        }
    }
    (dest != root).then_some(dest)
}

/// Rows of one table, restricted to the columns both stores know.
pub(crate) struct TableRows {
    pub columns: Vec<String>,
    pub rows: Vec<(i64, Vec<Value>)>,
}

impl TableRows {
    /// Read `table` from `source` in id order, keeping the non-id columns
    /// also present in `dest`.
    pub fn read(source: &Connection, dest: &Connection, table: &str) -> Result<Self> {
        let source_cols = table_columns(source, table)?;
        if source_cols.is_empty() {
            return Ok(Self {
                columns: Vec::new(),
                rows: Vec::new(),
            });
        }
        let dest_cols = table_columns(dest, table)?;
        let mut columns: Vec<String> = source_cols
            .intersection(&dest_cols)
            .filter(|c| c.as_str() != "id")
            .cloned()
            .collect();
        columns.sort();

        let select = if columns.is_empty() {
            format!("SELECT id FROM {} ORDER BY id", table)
        } else {
            format!("SELECT id, {} FROM {} ORDER BY id", columns.join(", "), table)
        };
        let mut stmt = source.prepare(&select)?;
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let values = (1..=width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((id, values))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { columns, rows })
    }

    pub fn index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Insert one row with the given columns, returning the new id.
pub(crate) fn insert_row(
    conn: &Connection,
    table: &str,
    columns: &[String],
    values: &[Value],
) -> Result<i64> {
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders.join(", ")
        )
    };
    conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
    Ok(conn.last_insert_rowid())
}

/// Text value of a column, `None` for NULL or non-text.
pub(crate) fn text_value(value: &Value) -> Option<&str> {
    match value {
        Value::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

pub(crate) fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        _ => None,
    }
}
