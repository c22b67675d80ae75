//! Image data model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Objective sentinel meaning "scale set by drawing a scale bar".
pub const CUSTOM_OBJECTIVE: &str = "Custom";

/// Kind of photograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    /// Habitat or fruit-body photo; measured in millimetres if at all
    #[default]
    Field,
    /// Photo taken through a microscope objective
    Microscope,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Field => "field",
            ImageType::Microscope => "microscope",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("microscope") {
            ImageType::Microscope
        } else {
            ImageType::Field
        }
    }
}

/// Crop rectangle used by ML workflows, in pixels of `crop_source_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// A stored image row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub observation_id: Option<i64>,
    pub filepath: PathBuf,
    pub original_filepath: Option<PathBuf>,
    pub image_type: ImageType,
    pub micro_category: Option<String>,
    /// Objective catalog key, [`CUSTOM_OBJECTIVE`], or none.
    pub objective_name: Option<String>,
    pub scale_microns_per_pixel: Option<f64>,
    pub calibration_id: Option<i64>,
    pub mount_medium: Option<String>,
    pub sample_type: Option<String>,
    pub contrast: Option<String>,
    pub measure_color: Option<String>,
    pub notes: Option<String>,
    pub crop_box: Option<CropBox>,
    pub crop_source_size: Option<(u32, u32)>,
    pub gps_source: bool,
    /// Below 1.0 when the stored image is downsampled relative to its calibration.
    pub resample_scale_factor: f64,
    pub created_at: Option<String>,
}

impl ImageRecord {
    /// A row with no scale or metadata set.
    pub fn new(filepath: impl Into<PathBuf>, image_type: ImageType) -> Self {
        Self {
            id: 0,
            observation_id: None,
            filepath: filepath.into(),
            original_filepath: None,
            image_type,
            micro_category: None,
            objective_name: None,
            scale_microns_per_pixel: None,
            calibration_id: None,
            mount_medium: None,
            sample_type: None,
            contrast: None,
            measure_color: None,
            notes: None,
            crop_box: None,
            crop_source_size: None,
            gps_source: false,
            resample_scale_factor: 1.0,
            created_at: None,
        }
    }

    pub fn is_microscope(&self) -> bool {
        self.image_type == ImageType::Microscope
    }

    pub fn is_custom_scale(&self) -> bool {
        self.objective_name.as_deref() == Some(CUSTOM_OBJECTIVE)
    }

    pub fn filename(&self) -> String {
        self.filepath
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Fields supplied when adding an image to an observation.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub source_path: PathBuf,
    pub image_type: ImageType,
    pub micro_category: Option<String>,
    pub objective_name: Option<String>,
    pub scale_microns_per_pixel: Option<f64>,
    pub calibration_id: Option<i64>,
    pub mount_medium: Option<String>,
    pub sample_type: Option<String>,
    pub contrast: Option<String>,
    pub measure_color: Option<String>,
    pub notes: Option<String>,
    pub gps_source: bool,
    pub resample_scale_factor: f64,
    /// Copy the file into the observation folder (otherwise reference it in place).
    pub copy_to_folder: bool,
    /// Full-resolution original to keep alongside the working copy.
    pub original_path: Option<PathBuf>,
}

impl NewImage {
    pub fn new(source_path: impl Into<PathBuf>, image_type: ImageType) -> Self {
        Self {
            source_path: source_path.into(),
            image_type,
            micro_category: None,
            objective_name: None,
            scale_microns_per_pixel: None,
            calibration_id: None,
            mount_medium: None,
            sample_type: None,
            contrast: None,
            measure_color: None,
            notes: None,
            gps_source: false,
            resample_scale_factor: 1.0,
            copy_to_folder: true,
            original_path: None,
        }
    }

    pub fn microscope(source_path: impl Into<PathBuf>) -> Self {
        Self::new(source_path, ImageType::Microscope)
    }

    pub fn with_objective(mut self, key: impl Into<String>) -> Self {
        self.objective_name = Some(key.into());
        self
    }

    pub fn with_scale(mut self, microns_per_pixel: f64) -> Self {
        self.scale_microns_per_pixel = Some(microns_per_pixel);
        self
    }

    pub fn with_calibration(mut self, calibration_id: i64) -> Self {
        self.calibration_id = Some(calibration_id);
        self
    }

    pub fn in_place(mut self) -> Self {
        self.copy_to_folder = false;
        self
    }
}
