//! YOLO TXT layout: one label file per image plus `dataset.yaml`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::{Dataset, DatasetWriter, IMAGES_DIR, SPORE_CLASS};
use crate::error::Result;

/// Directory holding the per-image label files.
pub const LABELS_DIR: &str = "labels";

/// Dataset description read by YOLO trainers.
pub const DATASET_FILE: &str = "dataset.yaml";

/// Normalized `class xc yc w h` boxes, class 0 being spores.
pub struct YoloWriter;

impl DatasetWriter for YoloWriter {
    fn id(&self) -> &'static str {
        "yolo"
    }

    fn write(&self, dataset: &Dataset, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let labels_dir = out_dir.join(LABELS_DIR);
        std::fs::create_dir_all(&labels_dir)?;
        let mut files = Vec::with_capacity(dataset.images.len() + 1);

        for image in &dataset.images {
            if image.width == 0 || image.height == 0 {
                log::warn!("Image {} has no dimensions, skipping labels", image.file_name);
                continue;
            }
            let (w, h) = (f64::from(image.width), f64::from(image.height));
            let mut content = String::new();
            for ann in &image.annotations {
                let b = &ann.bbox;
                let _ = writeln!(
                    content,
                    "0 {:.6} {:.6} {:.6} {:.6}",
                    (b.x + b.width / 2.0) / w,
                    (b.y + b.height / 2.0) / h,
                    b.width / w,
                    b.height / h
                );
            }
            let stem = Path::new(&image.file_name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown");
            let path = labels_dir.join(format!("{}.txt", stem));
            std::fs::write(&path, content)?;
            files.push(path);
        }

        let yaml = format!(
            "path: .\ntrain: {images}\nval: {images}\nnc: 1\nnames:\n  0: {class}\n",
            images = IMAGES_DIR,
            class = SPORE_CLASS
        );
        let yaml_path = out_dir.join(DATASET_FILE);
        std::fs::write(&yaml_path, yaml)?;
        files.push(yaml_path);
        Ok(files)
    }
}
