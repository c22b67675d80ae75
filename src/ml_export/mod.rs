//! Training-data export of spore annotations.
//!
//! Annotations are derived from four-point spore measurements: an
//! axis-aligned box around the four points, their centroid and the angle of
//! the length axis. Writers turn the collected [`Dataset`] into a concrete
//! on-disk layout.
//!
//! ```text
//! <out>/
//!   images/image_00001.jpg ...
//!   annotations.json          (COCO)
//!   labels/image_00001.txt    (YOLO)
//!   dataset.yaml              (YOLO)
//! ```

mod coco;
mod yolo;

pub use coco::{
    ANNOTATIONS_FILE, CocoAnnotation, CocoAttributes, CocoCategory, CocoDataset, CocoImage,
    CocoInfo, CocoWriter, load_coco,
};
pub use yolo::{DATASET_FILE, LABELS_DIR, YoloWriter};

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::db::Database;
use crate::error::Result;
use crate::geometry::Point;
use crate::model::{BoundingBox, DEFAULT_BBOX_PADDING, Measurement, SOURCE_MANUAL, SporeAnnotation};

/// Directory under the output root holding the renumbered image copies.
pub const IMAGES_DIR: &str = "images";

/// Class name of the single exported category.
pub const SPORE_CLASS: &str = "spore";

/// Derive the annotation for a four-point measurement.
///
/// `spore_number` is left at 0 for the caller to assign. Returns `None` for
/// measurements without all four points.
pub fn derive_annotation(
    measurement: &Measurement,
    image_size: (u32, u32),
    padding: f64,
    source: &str,
) -> Option<SporeAnnotation> {
    let shape = measurement.rect_shape()?;
    let points: Vec<Point> = shape.points().into_iter().flatten().collect();
    let bbox = BoundingBox::around(&points, padding, image_size)?;
    let n = points.len() as f64;
    let center = Point::new(
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
    );
    let (a, b) = shape.length_line();
    let rotation_angle = (b.y - a.y).atan2(b.x - a.x).to_degrees();
    Some(SporeAnnotation {
        id: 0,
        image_id: measurement.image_id,
        measurement_id: Some(measurement.id),
        spore_number: 0,
        bbox,
        center,
        length_um: measurement.length_um,
        width_um: measurement.width_um,
        rotation_angle,
        source: source.to_string(),
        created_at: None,
    })
}

/// Derive and store the annotation for a stored measurement.
///
/// Returns the annotation id and spore number, or `None` when the
/// measurement has no four-point geometry.
pub fn annotate_measurement(
    db: &mut Database,
    measurement_id: i64,
    image_size: (u32, u32),
    padding: f64,
    source: &str,
) -> Result<Option<(i64, i64)>> {
    let measurement = db
        .get_measurement(measurement_id)?
        .ok_or_else(|| crate::error::Error::not_found("measurement", measurement_id))?;
    match derive_annotation(&measurement, image_size, padding, source) {
        Some(annotation) => Ok(Some(db.add_annotation(&annotation)?)),
        None => Ok(None),
    }
}

/// One exported image with its annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetImage {
    pub image_id: i64,
    /// Path relative to the output root, `images/image_00001.ext`.
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub annotations: Vec<SporeAnnotation>,
}

/// Everything a writer needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub images: Vec<DatasetImage>,
}

impl Dataset {
    pub fn annotation_count(&self) -> usize {
        self.images.iter().map(|i| i.annotations.len()).sum()
    }
}

/// A target layout for exported annotations.
pub trait DatasetWriter {
    /// Short identifier, e.g. `"coco"`.
    fn id(&self) -> &'static str;

    /// Write annotation files under `out_dir`; returns the files created.
    fn write(&self, dataset: &Dataset, out_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// An image left out of the export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedImage {
    pub image_id: i64,
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of an export run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportStats {
    pub images_exported: usize,
    pub annotations_exported: usize,
    pub skipped: Vec<SkippedImage>,
    pub files_created: Vec<PathBuf>,
}

/// Options for [`export_dataset`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MlExportOptions {
    pub padding: f64,
    /// Leave out images that end up with no annotations.
    pub skip_empty: bool,
}

impl Default for MlExportOptions {
    fn default() -> Self {
        Self {
            padding: DEFAULT_BBOX_PADDING,
            skip_empty: true,
        }
    }
}

/// Stored annotations of an image, plus derived ones for measurements that
/// have none yet, numbered after the stored ones.
fn image_annotations(
    db: &Database,
    image_id: i64,
    size: (u32, u32),
    padding: f64,
) -> Result<Vec<SporeAnnotation>> {
    let mut annotations = db.annotations_for_image(image_id)?;
    let covered: HashSet<i64> = annotations.iter().filter_map(|a| a.measurement_id).collect();
    let mut next = annotations.iter().map(|a| a.spore_number).max().unwrap_or(0) + 1;
    for measurement in db.measurements_for_image(image_id)? {
        if !measurement.is_spore() || covered.contains(&measurement.id) {
            continue;
        }
        if let Some(mut annotation) = derive_annotation(&measurement, size, padding, SOURCE_MANUAL) {
            annotation.spore_number = next;
            next += 1;
            annotations.push(annotation);
        }
    }
    Ok(annotations)
}

/// Collect, copy and write a dataset for the given images.
pub fn export_dataset(
    db: &Database,
    image_ids: &[i64],
    out_dir: &Path,
    writer: &dyn DatasetWriter,
    options: &MlExportOptions,
) -> Result<ExportStats> {
    log::info!(
        "Exporting {} images as {} to {:?}",
        image_ids.len(),
        writer.id(),
        out_dir
    );
    let images_dir = out_dir.join(IMAGES_DIR);
    fs::create_dir_all(&images_dir)?;

    let mut stats = ExportStats::default();
    let mut dataset = Dataset::default();
    for &image_id in image_ids {
        let image = db.require_image(image_id)?;
        let skip = |reason: String| SkippedImage {
            image_id,
            path: image.filepath.clone(),
            reason,
        };
        let size = match image::image_dimensions(&image.filepath) {
            Ok(size) => size,
            Err(e) => {
                log::warn!("Skipping image {} ({:?}): {}", image_id, image.filepath, e);
                stats.skipped.push(skip(e.to_string()));
                continue;
            }
        };
        let annotations = image_annotations(db, image_id, size, options.padding)?;
        if annotations.is_empty() && options.skip_empty {
            stats.skipped.push(skip("no four-point spore measurements".to_string()));
            continue;
        }

        let ext = image
            .filepath
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "jpg".to_string());
        let name = format!("image_{:05}.{}", dataset.images.len() + 1, ext);
        let dest = images_dir.join(&name);
        if let Err(e) = fs::copy(&image.filepath, &dest) {
            log::warn!("Could not copy {:?}: {}", image.filepath, e);
            stats.skipped.push(skip(e.to_string()));
            continue;
        }
        stats.files_created.push(dest);
        dataset.images.push(DatasetImage {
            image_id,
            file_name: format!("{}/{}", IMAGES_DIR, name),
            width: size.0,
            height: size.1,
            annotations,
        });
    }

    stats.files_created.extend(writer.write(&dataset, out_dir)?);
    stats.images_exported = dataset.images.len();
    stats.annotations_exported = dataset.annotation_count();
    log::info!(
        "Exported {} images with {} annotations ({} skipped)",
        stats.images_exported,
        stats.annotations_exported,
        stats.skipped.len()
    );
    Ok(stats)
}

#[cfg(test)]
mod tests;
