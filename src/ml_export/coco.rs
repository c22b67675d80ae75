//! COCO JSON layout: a single `annotations.json` at the output root.

use std::path::{Path, PathBuf};

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use super::{Dataset, DatasetWriter, SPORE_CLASS};
use crate::error::Result;

/// File written at the output root.
pub const ANNOTATIONS_FILE: &str = "annotations.json";

const SPORE_CATEGORY_ID: u32 = 1;

/// COCO dataset with one `spore` category.
pub struct CocoWriter;

impl CocoWriter {
    /// Build the COCO document without touching the filesystem.
    pub fn to_coco(&self, dataset: &Dataset) -> CocoDataset {
        let now = chrono::Local::now();
        let mut coco = CocoDataset {
            info: CocoInfo {
                year: now.year().try_into().unwrap_or_default(),
                version: "1.0".to_string(),
                description: "Mushroom Spore Dataset".to_string(),
                contributor: "MycoLog".to_string(),
                url: String::new(),
                date_created: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            },
            categories: vec![CocoCategory {
                id: SPORE_CATEGORY_ID,
                name: SPORE_CLASS.to_string(),
                supercategory: "fungi".to_string(),
            }],
            ..CocoDataset::default()
        };

        let mut annotation_id = 1u64;
        for (idx, image) in dataset.images.iter().enumerate() {
            let image_id = (idx + 1) as u64;
            coco.images.push(CocoImage {
                id: image_id,
                file_name: image.file_name.clone(),
                width: image.width,
                height: image.height,
            });
            for ann in &image.annotations {
                coco.annotations.push(CocoAnnotation {
                    id: annotation_id,
                    image_id,
                    category_id: SPORE_CATEGORY_ID,
                    bbox: [ann.bbox.x, ann.bbox.y, ann.bbox.width, ann.bbox.height],
                    area: ann.bbox.area(),
                    iscrowd: 0,
                    attributes: CocoAttributes {
                        center: [ann.center.x, ann.center.y],
                        length_um: ann.length_um,
                        width_um: ann.width_um,
                        rotation_angle: ann.rotation_angle,
                        spore_number: ann.spore_number,
                        source: ann.source.clone(),
                    },
                });
                annotation_id += 1;
            }
        }
        coco
    }
}

impl DatasetWriter for CocoWriter {
    fn id(&self) -> &'static str {
        "coco"
    }

    fn write(&self, dataset: &Dataset, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let path = out_dir.join(ANNOTATIONS_FILE);
        let json = serde_json::to_string_pretty(&self.to_coco(dataset))?;
        std::fs::write(&path, json)?;
        Ok(vec![path])
    }
}

/// Read an exported `annotations.json`.
pub fn load_coco(path: &Path) -> Result<CocoDataset> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

// COCO document structures

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CocoDataset {
    pub info: CocoInfo,
    pub images: Vec<CocoImage>,
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CocoInfo {
    #[serde(default)]
    pub year: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contributor: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub date_created: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u32,
    /// `[x, y, w, h]`
    pub bbox: [f64; 4],
    pub area: f64,
    pub iscrowd: u8,
    pub attributes: CocoAttributes,
}

/// Spore-specific values carried next to the box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAttributes {
    pub center: [f64; 2],
    pub length_um: f64,
    pub width_um: Option<f64>,
    pub rotation_angle: f64,
    pub spore_number: i64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
}
