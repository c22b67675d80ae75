//! Objective catalog, active-calibration index and per-image scale resolution.
//!
//! Resolution order for an image:
//! 1. its own calibration, when the id still points at a row
//! 2. the catalog's µm/px for its objective, divided by the resample factor
//!    when the image is downsampled
//! 3. the literal `scale_microns_per_pixel` on the row
//!
//! Anything else is unresolved and measuring is refused.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CUSTOM_OBJECTIVE, Calibration, ImageRecord};

/// Relative disagreement that triggers the older-standard warning.
pub const SCALE_TOLERANCE: f64 = 0.01;

/// Megapixel ratio at which a resolution mismatch is reported.
pub const MEGAPIXEL_MISMATCH_RATIO: f64 = 1.5;

/// Resample factors at or above this count as full resolution.
pub const FULL_RESOLUTION_FACTOR: f64 = 0.999;

/// One microscope objective in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub magnification: String,
    pub microns_per_pixel: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

impl Objective {
    pub fn new(name: impl Into<String>, magnification: impl Into<String>, mpp: f64) -> Self {
        Self {
            name: name.into(),
            magnification: magnification.into(),
            microns_per_pixel: mpp,
            notes: None,
            is_default: false,
        }
    }
}

/// The objective catalog stored in `objectives.json`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectiveCatalog {
    objectives: BTreeMap<String, Objective>,
    path: Option<PathBuf>,
}

impl ObjectiveCatalog {
    /// Catalog used when `objectives.json` is missing.
    pub fn seeded() -> Self {
        let mut objectives = BTreeMap::new();
        objectives.insert("4X".to_string(), Objective::new("4X/0.10 Plan achro", "4X", 1.258));
        let mut ten = Objective::new("10X/0.25 Plan achro", "10X", 0.314);
        ten.is_default = true;
        objectives.insert("10X".to_string(), ten);
        objectives.insert(
            "40X".to_string(),
            Objective::new("40X/0.65 Plan achro", "40X", 0.0787),
        );
        objectives.insert(
            "100X".to_string(),
            Objective::new("100X/1.25 Oil Plan achro", "100X", 0.0315),
        );
        Self {
            objectives,
            path: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let objectives: BTreeMap<String, Objective> = serde_json::from_str(json)?;
        let mut catalog = Self::default();
        for (key, objective) in objectives {
            if key == CUSTOM_OBJECTIVE {
                log::warn!("Ignoring reserved objective key {:?} in catalog", key);
                continue;
            }
            catalog.objectives.insert(key, objective);
        }
        Ok(catalog)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.objectives)?)
    }

    /// Load from `path`, seeding the file with defaults when it is missing.
    pub fn load_or_seed(path: &Path) -> Result<Self> {
        let mut catalog = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            Self::from_json(&json)?
        } else {
            log::info!("No objective catalog at {:?}, writing defaults", path);
            let seeded = Self::seeded();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, seeded.to_json()?)?;
            seeded
        };
        catalog.path = Some(path.to_path_buf());
        Ok(catalog)
    }

    /// Write back to the file the catalog was loaded from, if any.
    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            std::fs::write(path, self.to_json()?)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Objective> {
        self.objectives.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objectives.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objectives.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Objective)> {
        self.objectives.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.objectives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
    }

    /// Key of the objective flagged as default, else the first key.
    pub fn default_key(&self) -> Option<&str> {
        self.objectives
            .iter()
            .find(|(_, o)| o.is_default)
            .or_else(|| self.objectives.iter().next())
            .map(|(k, _)| k.as_str())
    }

    /// Add or replace an objective.
    pub fn upsert(&mut self, key: &str, objective: Objective) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::invalid_input("objective key must not be empty"));
        }
        if key == CUSTOM_OBJECTIVE {
            return Err(Error::invalid_input(format!(
                "{:?} is reserved for scale-bar calibration",
                CUSTOM_OBJECTIVE
            )));
        }
        if !(objective.microns_per_pixel > 0.0) {
            return Err(Error::invalid_input(format!(
                "objective scale must be positive, got {}",
                objective.microns_per_pixel
            )));
        }
        if objective.is_default {
            for other in self.objectives.values_mut() {
                other.is_default = false;
            }
        }
        self.objectives.insert(key.to_string(), objective);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Objective> {
        self.objectives.remove(key)
    }

    /// Update an objective's nominal scale, returning the previous value.
    pub fn set_scale(&mut self, key: &str, microns_per_pixel: f64) -> Result<f64> {
        if !(microns_per_pixel > 0.0) {
            return Err(Error::invalid_input(format!(
                "objective scale must be positive, got {}",
                microns_per_pixel
            )));
        }
        let objective = self
            .objectives
            .get_mut(key)
            .ok_or_else(|| Error::invalid_input(format!("unknown objective {:?}", key)))?;
        Ok(std::mem::replace(
            &mut objective.microns_per_pixel,
            microns_per_pixel,
        ))
    }

    /// Copy each active calibration's scale onto its objective.
    ///
    /// Returns the keys whose scale changed.
    pub fn sync_from(&mut self, active: &ActiveCalibrations) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, calibration) in active.iter() {
            if let Some(objective) = self.objectives.get_mut(key) {
                if objective.microns_per_pixel != calibration.microns_per_pixel {
                    objective.microns_per_pixel = calibration.microns_per_pixel;
                    changed.push(key.to_string());
                }
            }
        }
        changed
    }
}

/// In-memory view of the active calibration per objective.
#[derive(Debug, Clone, Default)]
pub struct ActiveCalibrations {
    by_objective: BTreeMap<String, Calibration>,
}

impl ActiveCalibrations {
    /// Rebuild from the store.
    pub fn load(db: &crate::db::Database) -> Result<Self> {
        let mut index = Self::default();
        index.reload(db)?;
        Ok(index)
    }

    pub fn reload(&mut self, db: &crate::db::Database) -> Result<()> {
        self.by_objective = db
            .active_calibrations()?
            .into_iter()
            .map(|c| (c.objective_key.clone(), c))
            .collect();
        log::debug!(
            "Active calibration index holds {} objectives",
            self.by_objective.len()
        );
        Ok(())
    }

    pub fn get(&self, objective_key: &str) -> Option<&Calibration> {
        self.by_objective.get(objective_key)
    }

    /// Record a newly activated calibration.
    pub fn activate(&mut self, calibration: Calibration) {
        self.by_objective
            .insert(calibration.objective_key.clone(), calibration);
    }

    /// Drop a calibration that was deleted or deactivated.
    pub fn forget(&mut self, calibration_id: i64) {
        self.by_objective.retain(|_, c| c.id != calibration_id);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Calibration)> {
        self.by_objective.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Where a resolved scale came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleSource {
    Calibration { calibration_id: i64 },
    Objective { key: String },
    Stored,
}

/// Advisory problems found while resolving a scale.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleWarning {
    /// The stored scale disagrees with the calibration or catalog value.
    OlderStandard { stored: f64, current: f64 },
    /// The image and its calibration were taken at different resolutions.
    ResolutionMismatch {
        image_megapixels: f64,
        calibration_megapixels: f64,
    },
}

impl fmt::Display for ScaleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleWarning::OlderStandard { stored, current } => write!(
                f,
                "stored scale {:.5} µm/px differs from current {:.5} µm/px",
                stored, current
            ),
            ScaleWarning::ResolutionMismatch {
                image_megapixels,
                calibration_megapixels,
            } => write!(
                f,
                "image is {:.1} MP but its calibration was made at {:.1} MP",
                image_megapixels, calibration_megapixels
            ),
        }
    }
}

/// Effective µm/px for an image.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleResolution {
    pub microns_per_pixel: f64,
    pub source: ScaleSource,
    pub warnings: Vec<ScaleWarning>,
}

impl ScaleResolution {
    pub fn is_older_standard(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, ScaleWarning::OlderStandard { .. }))
    }
}

/// Human-readable scale state shown next to an image.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleStatus {
    FieldNoScale,
    OlderStandard,
    Custom,
    Objective { label: String },
    Stored,
    NoScale,
}

impl fmt::Display for ScaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleStatus::FieldNoScale => f.write_str("Field photo — no scale set"),
            ScaleStatus::OlderStandard => f.write_str("Scale calibrated — older standard"),
            ScaleStatus::Custom => f.write_str("Custom scale"),
            ScaleStatus::Objective { label } => f.write_str(label),
            ScaleStatus::Stored => f.write_str("Scale set"),
            ScaleStatus::NoScale => f.write_str("No scale set"),
        }
    }
}

/// Effective megapixels of a frame, undoing any downsampling.
pub fn effective_megapixels(width: u32, height: u32, resample_scale_factor: f64) -> f64 {
    let factor = if resample_scale_factor > 0.0 {
        resample_scale_factor
    } else {
        1.0
    };
    f64::from(width) * f64::from(height) / 1e6 / (factor * factor)
}

fn relative_difference(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return f64::INFINITY;
    }
    (a - b).abs() / b.abs()
}

/// Compare image and calibration megapixels.
pub fn resolution_mismatch(
    image_megapixels: f64,
    calibration_megapixels: f64,
) -> Option<ScaleWarning> {
    if image_megapixels <= 0.0 || calibration_megapixels <= 0.0 {
        return None;
    }
    let differs = relative_difference(image_megapixels, calibration_megapixels) > SCALE_TOLERANCE;
    let ratio = image_megapixels.max(calibration_megapixels)
        / image_megapixels.min(calibration_megapixels);
    (differs && ratio >= MEGAPIXEL_MISMATCH_RATIO).then_some(ScaleWarning::ResolutionMismatch {
        image_megapixels,
        calibration_megapixels,
    })
}

/// Resolves image scales against the catalog and the active calibrations.
#[derive(Debug, Clone, Copy)]
pub struct ScaleResolver<'a> {
    pub catalog: &'a ObjectiveCatalog,
    pub active: &'a ActiveCalibrations,
}

impl<'a> ScaleResolver<'a> {
    pub fn new(catalog: &'a ObjectiveCatalog, active: &'a ActiveCalibrations) -> Self {
        Self { catalog, active }
    }

    /// Resolve the scale of `image`.
    ///
    /// `calibration` is the row named by `image.calibration_id`, or `None`
    /// when the id is unset or dangling. `image_size` enables the resolution
    /// check.
    pub fn resolve(
        &self,
        image: &ImageRecord,
        calibration: Option<&Calibration>,
        image_size: Option<(u32, u32)>,
    ) -> Option<ScaleResolution> {
        let factor = image.resample_scale_factor;
        let (mpp, source) = if let Some(c) = calibration.filter(|c| c.microns_per_pixel > 0.0) {
            (
                c.microns_per_pixel,
                ScaleSource::Calibration {
                    calibration_id: c.id,
                },
            )
        } else if let Some((key, objective)) = image
            .objective_name
            .as_deref()
            .and_then(|key| self.catalog.get(key).map(|o| (key, o)))
        {
            let mut mpp = objective.microns_per_pixel;
            if factor > 0.0 && factor < 1.0 {
                mpp /= factor;
            }
            (
                mpp,
                ScaleSource::Objective {
                    key: key.to_string(),
                },
            )
        } else if let Some(stored) = image.scale_microns_per_pixel.filter(|s| *s > 0.0) {
            (stored, ScaleSource::Stored)
        } else {
            return None;
        };

        let mut warnings = Vec::new();
        if source != ScaleSource::Stored && factor >= FULL_RESOLUTION_FACTOR {
            if let Some(stored) = image.scale_microns_per_pixel.filter(|s| *s > 0.0) {
                if relative_difference(stored, mpp) > SCALE_TOLERANCE {
                    warnings.push(ScaleWarning::OlderStandard {
                        stored,
                        current: mpp,
                    });
                }
            }
        }

        if image.is_microscope() {
            let known = calibration.or_else(|| {
                image
                    .objective_name
                    .as_deref()
                    .and_then(|key| self.active.get(key))
            });
            if let (Some(c), Some((w, h))) = (known, image_size) {
                if let Some(cal_mp) = c.megapixels {
                    let image_mp = effective_megapixels(w, h, factor);
                    if let Some(warning) = resolution_mismatch(image_mp, cal_mp) {
                        warnings.push(warning);
                    }
                }
            }
        }

        for warning in &warnings {
            log::warn!("Image {}: {}", image.id, warning);
        }
        Some(ScaleResolution {
            microns_per_pixel: mpp,
            source,
            warnings,
        })
    }

    /// Like [`ScaleResolver::resolve`], failing when no scale is available.
    pub fn require(
        &self,
        image: &ImageRecord,
        calibration: Option<&Calibration>,
        image_size: Option<(u32, u32)>,
    ) -> Result<ScaleResolution> {
        self.resolve(image, calibration, image_size)
            .ok_or(Error::ScaleUnresolved { image_id: image.id })
    }

    /// Status line for an image.
    pub fn status(&self, image: &ImageRecord, calibration: Option<&Calibration>) -> ScaleStatus {
        match self.resolve(image, calibration, None) {
            None if !image.is_microscope() => ScaleStatus::FieldNoScale,
            None => ScaleStatus::NoScale,
            Some(res) if res.is_older_standard() => ScaleStatus::OlderStandard,
            Some(res) => match res.source {
                ScaleSource::Objective { key } => ScaleStatus::Objective {
                    label: self
                        .catalog
                        .get(&key)
                        .map(|o| o.name.clone())
                        .unwrap_or(key),
                },
                ScaleSource::Calibration { .. } | ScaleSource::Stored if image.is_custom_scale() => {
                    ScaleStatus::Custom
                }
                ScaleSource::Calibration { .. } => ScaleStatus::Objective {
                    label: image
                        .objective_name
                        .as_deref()
                        .and_then(|k| self.catalog.get(k))
                        .map(|o| o.name.clone())
                        .unwrap_or_else(|| "Calibrated".to_string()),
                },
                ScaleSource::Stored => ScaleStatus::Stored,
            },
        }
    }
}

/// Whether `key` may be stored as an image's objective.
pub fn validate_objective_key(catalog: &ObjectiveCatalog, key: Option<&str>) -> Result<()> {
    match key {
        None => Ok(()),
        Some(k) if k == CUSTOM_OBJECTIVE || catalog.contains(k) => Ok(()),
        Some(k) => Err(Error::invalid_input(format!("unknown objective {:?}", k))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageType;

    fn image() -> ImageRecord {
        ImageRecord {
            id: 7,
            ..ImageRecord::new("/a.jpg", ImageType::Microscope)
        }
    }

    fn calibration(id: i64, mpp: f64) -> Calibration {
        Calibration {
            id,
            objective_key: "100X".into(),
            microns_per_pixel: mpp,
            is_active: true,
            ..Calibration::default()
        }
    }

    #[test]
    fn test_resolution_order() {
        let catalog = ObjectiveCatalog::seeded();
        let active = ActiveCalibrations::default();
        let resolver = ScaleResolver::new(&catalog, &active);

        let mut img = image();
        assert!(resolver.resolve(&img, None, None).is_none());
        assert!(matches!(
            resolver.require(&img, None, None),
            Err(Error::ScaleUnresolved { image_id: 7 })
        ));

        img.scale_microns_per_pixel = Some(0.05);
        let res = resolver.resolve(&img, None, None).unwrap();
        assert_eq!(res.source, ScaleSource::Stored);
        assert_eq!(res.microns_per_pixel, 0.05);

        img.objective_name = Some("100X".into());
        img.scale_microns_per_pixel = Some(0.0315);
        let res = resolver.resolve(&img, None, None).unwrap();
        assert_eq!(res.source, ScaleSource::Objective { key: "100X".into() });
        assert!(res.warnings.is_empty());

        let cal = calibration(3, 0.0312);
        let res = resolver.resolve(&img, Some(&cal), None).unwrap();
        assert_eq!(res.source, ScaleSource::Calibration { calibration_id: 3 });
        assert_eq!(res.microns_per_pixel, 0.0312);
    }

    #[test]
    fn test_downsampled_objective_scale() {
        let catalog = ObjectiveCatalog::seeded();
        let active = ActiveCalibrations::default();
        let resolver = ScaleResolver::new(&catalog, &active);
        let mut img = image();
        img.objective_name = Some("100X".into());
        img.resample_scale_factor = 0.5;
        img.scale_microns_per_pixel = Some(0.063);
        let res = resolver.resolve(&img, None, None).unwrap();
        assert!((res.microns_per_pixel - 0.063).abs() < 1e-12);
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn test_older_standard_warning() {
        let catalog = ObjectiveCatalog::seeded();
        let active = ActiveCalibrations::default();
        let resolver = ScaleResolver::new(&catalog, &active);
        let mut img = image();
        img.objective_name = Some("100X".into());
        img.scale_microns_per_pixel = Some(0.0330);
        let res = resolver.resolve(&img, None, None).unwrap();
        assert!(res.is_older_standard());
        assert_eq!(
            resolver.status(&img, None).to_string(),
            "Scale calibrated — older standard"
        );

        img.resample_scale_factor = 0.9;
        img.scale_microns_per_pixel = Some(0.0315 / 0.9 * 1.2);
        assert!(!resolver.resolve(&img, None, None).unwrap().is_older_standard());
    }

    #[test]
    fn test_resolution_mismatch() {
        assert!(resolution_mismatch(20.0, 12.0).is_some());
        assert!(resolution_mismatch(12.5, 12.0).is_none());
        assert!(resolution_mismatch(0.0, 12.0).is_none());
        assert!((effective_megapixels(2000, 1500, 0.5) - 12.0).abs() < 1e-9);

        let catalog = ObjectiveCatalog::seeded();
        let mut active = ActiveCalibrations::default();
        let mut cal = calibration(1, 0.0315);
        cal.megapixels = Some(20.0);
        active.activate(cal);
        let resolver = ScaleResolver::new(&catalog, &active);
        let mut img = image();
        img.objective_name = Some("100X".into());
        let res = resolver.resolve(&img, None, Some((4000, 3000))).unwrap();
        assert!(matches!(
            res.warnings[0],
            ScaleWarning::ResolutionMismatch { .. }
        ));
    }

    #[test]
    fn test_status_strings() {
        let catalog = ObjectiveCatalog::seeded();
        let active = ActiveCalibrations::default();
        let resolver = ScaleResolver::new(&catalog, &active);

        let mut field = image();
        field.image_type = ImageType::Field;
        assert_eq!(
            resolver.status(&field, None).to_string(),
            "Field photo — no scale set"
        );
        assert_eq!(resolver.status(&image(), None).to_string(), "No scale set");

        let mut custom = image();
        custom.objective_name = Some(CUSTOM_OBJECTIVE.into());
        custom.scale_microns_per_pixel = Some(0.2);
        assert_eq!(resolver.status(&custom, None), ScaleStatus::Custom);

        let mut ten = image();
        ten.objective_name = Some("10X".into());
        assert_eq!(
            resolver.status(&ten, None).to_string(),
            "10X/0.25 Plan achro"
        );
    }

    #[test]
    fn test_catalog_rejects_custom_key() {
        let mut catalog = ObjectiveCatalog::seeded();
        assert!(matches!(
            catalog.upsert("Custom", Objective::new("Scale bar", "-", 0.1)),
            Err(Error::InvalidInput { .. })
        ));
        assert!(catalog.upsert("60X", Objective::new("60X", "60X", 0.0)).is_err());
        assert!(validate_objective_key(&catalog, Some("Custom")).is_ok());
        assert!(validate_objective_key(&catalog, Some("63X")).is_err());

        let parsed = ObjectiveCatalog::from_json(
            r#"{"Custom": {"name": "x", "magnification": "x", "microns_per_pixel": 1.0},
                "10X": {"name": "10X/0.25 Plan achro", "magnification": "10X",
                        "microns_per_pixel": 0.314, "notes": "free text"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("10X").unwrap().notes.as_deref(), Some("free text"));
    }

    #[test]
    fn test_load_or_seed_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objectives.json");
        let mut catalog = ObjectiveCatalog::load_or_seed(&path).unwrap();
        assert!(path.exists());
        assert_eq!(catalog.default_key(), Some("10X"));

        let mut active = ActiveCalibrations::default();
        let mut cal = calibration(9, 0.0320);
        cal.objective_key = "100X".into();
        active.activate(cal);
        assert_eq!(catalog.sync_from(&active), vec!["100X".to_string()]);
        catalog.save().unwrap();

        let reloaded = ObjectiveCatalog::load_or_seed(&path).unwrap();
        assert_eq!(reloaded.get("100X").unwrap().microns_per_pixel, 0.0320);
        active.forget(9);
        assert!(active.get("100X").is_none());
    }
}
