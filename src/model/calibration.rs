//! Calibration data model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A stored calibration row for one objective.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    pub id: i64,
    pub objective_key: String,
    pub calibration_date: String,
    pub microns_per_pixel: f64,
    pub std_dev: Option<f64>,
    pub confidence_low: Option<f64>,
    pub confidence_high: Option<f64>,
    pub num_measurements: i64,
    /// Serialized [`CalibrationMeasurement`] list.
    pub measurements_json: Option<String>,
    /// Reference image the calibration was drawn on.
    pub image_filepath: Option<PathBuf>,
    pub camera: Option<String>,
    pub megapixels: Option<f64>,
    pub target_sampling_pct: Option<f64>,
    pub resample_scale_factor: Option<f64>,
    pub calibration_image_width: Option<u32>,
    pub calibration_image_height: Option<u32>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: Option<String>,
}

impl Calibration {
    /// Decode the stored per-image measurement list.
    pub fn measurements(&self) -> Vec<CalibrationMeasurement> {
        self.measurements_json
            .as_deref()
            .and_then(|json| match serde_json::from_str(json) {
                Ok(list) => Some(list),
                Err(e) => {
                    log::warn!("Calibration {} has unreadable measurements: {}", self.id, e);
                    None
                }
            })
            .unwrap_or_default()
    }
}

/// Summary statistics over repeated scale-bar measurements.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationStats {
    pub std_dev: Option<f64>,
    pub confidence_low: Option<f64>,
    pub confidence_high: Option<f64>,
    pub num_measurements: i64,
}

/// One scale-bar measurement recorded in `measurements_json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationMeasurement {
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub pixel_distance: Option<f64>,
    #[serde(default)]
    pub known_length_um: Option<f64>,
    #[serde(default)]
    pub microns_per_pixel: Option<f64>,
    /// Size of the full frame the measured crop came from.
    #[serde(default)]
    pub crop_source_size: Option<(u32, u32)>,
}

/// Fields supplied when recording a calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCalibration {
    pub objective_key: String,
    pub microns_per_pixel: f64,
    pub calibration_date: Option<String>,
    pub stats: Option<CalibrationStats>,
    pub measurements: Vec<CalibrationMeasurement>,
    pub image_filepath: Option<PathBuf>,
    pub camera: Option<String>,
    pub megapixels: Option<f64>,
    pub target_sampling_pct: Option<f64>,
    pub resample_scale_factor: Option<f64>,
    pub calibration_image_size: Option<(u32, u32)>,
    pub notes: Option<String>,
    pub set_active: bool,
}

impl NewCalibration {
    pub fn new(objective_key: impl Into<String>, microns_per_pixel: f64) -> Self {
        Self {
            objective_key: objective_key.into(),
            microns_per_pixel,
            calibration_date: None,
            stats: None,
            measurements: Vec::new(),
            image_filepath: None,
            camera: None,
            megapixels: None,
            target_sampling_pct: None,
            resample_scale_factor: None,
            calibration_image_size: None,
            notes: None,
            set_active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.set_active = false;
        self
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.calibration_date = Some(date.into());
        self
    }
}
