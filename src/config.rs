//! Application paths and the `app_settings.json` key/value store.
//!
//! Settings are a flat JSON object. Values are strings except for the option
//! lists (JSON arrays) and the per-observation gallery settings (objects).
//! Unknown keys are preserved on save.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Log level setting for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Show only errors
    Error,
    /// Show errors and warnings
    Warn,
    /// Show errors, warnings, and info messages
    #[default]
    Info,
    /// Show debug-level logging
    Debug,
    /// Show all log messages including trace
    Trace,
}

impl LogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// All log levels from least to most verbose.
    pub fn all() -> &'static [LogLevel] {
        &[
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ]
    }

    /// Convert to log crate's LevelFilter.
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::all()
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "log_level".to_string(),
                value: s.to_string(),
            })
    }
}

/// Where full-resolution originals are kept when an image is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OriginalStorageMode {
    /// `<observation folder>/originals/`
    Observation,
    /// `<originals dir>/<path relative to images root>/`
    Global,
    /// Originals are not kept
    #[default]
    None,
}

impl OriginalStorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginalStorageMode::Observation => "observation",
            OriginalStorageMode::Global => "global",
            OriginalStorageMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "observation" => Some(OriginalStorageMode::Observation),
            "global" => Some(OriginalStorageMode::Global),
            "none" => Some(OriginalStorageMode::None),
            _ => None,
        }
    }
}

/// Every on-disk location derived from the application data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub const DATABASE_FILE: &'static str = "mushrooms.db";
    pub const REFERENCE_FILE: &'static str = "reference_values.db";
    pub const OBJECTIVES_FILE: &'static str = "objectives.json";
    pub const SETTINGS_FILE: &'static str = "app_settings.json";

    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Platform data directory, e.g. `~/.local/share/MycoLog`.
    pub fn default_data_dir() -> Option<PathBuf> {
        if let Some(dir) = dirs::data_dir() {
            Some(dir.join("MycoLog"))
        } else {
            dirs::home_dir().map(|home| home.join(".mycolog"))
        }
    }

    pub fn from_default_dir() -> Result<Self, ConfigError> {
        Self::default_data_dir()
            .map(Self::new)
            .ok_or(ConfigError::NoDataDir)
    }

    pub fn database(&self) -> PathBuf {
        self.data_dir.join(Self::DATABASE_FILE)
    }

    pub fn reference_database(&self) -> PathBuf {
        self.data_dir.join(Self::REFERENCE_FILE)
    }

    pub fn objectives(&self) -> PathBuf {
        self.data_dir.join(Self::OBJECTIVES_FILE)
    }

    pub fn settings(&self) -> PathBuf {
        self.data_dir.join(Self::SETTINGS_FILE)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.data_dir.join("thumbnails")
    }

    pub fn calibrations_dir(&self) -> PathBuf {
        self.data_dir.join("calibrations")
    }

    pub fn originals_dir(&self) -> PathBuf {
        self.data_dir.join("originals")
    }

    /// Apply directory overrides from settings.
    pub fn with_settings(&self, settings: &AppSettings) -> ResolvedPaths {
        ResolvedPaths {
            database: settings
                .get_str(keys::DATABASE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| self.database()),
            images_dir: settings
                .get_str(keys::IMAGES_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| self.images_dir()),
            originals_dir: settings
                .get_str(keys::ORIGINALS_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| self.originals_dir()),
        }
    }

    /// Create the directory skeleton.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.data_dir.clone(),
            self.images_dir(),
            self.thumbnails_dir(),
            self.calibrations_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Locations after settings overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub database: PathBuf,
    pub images_dir: PathBuf,
    pub originals_dir: PathBuf,
}

/// Setting key names.
pub mod keys {
    pub const UI_LANGUAGE: &str = "ui_language";
    pub const VERNACULAR_LANGUAGE: &str = "vernacular_language";
    pub const DATABASE_FOLDER: &str = "database_folder";
    pub const DATABASE_PATH: &str = "database_path";
    pub const IMAGES_DIR: &str = "images_dir";
    pub const ORIGINALS_DIR: &str = "originals_dir";
    pub const ORIGINAL_STORAGE_MODE: &str = "original_storage_mode";
    pub const LAST_EXPORT_DIR: &str = "last_export_dir";
    pub const ARTSOBS_UPLOAD_TARGET: &str = "artsobs_upload_target";
    pub const MEASURE_CATEGORIES: &str = "measure_categories";
    pub const CONTRAST_OPTIONS: &str = "contrast_options";
    pub const CONTRAST_DEFAULT: &str = "contrast_default";
    pub const MOUNT_OPTIONS: &str = "mount_options";
    pub const MOUNT_DEFAULT: &str = "mount_default";
    pub const SAMPLE_OPTIONS: &str = "sample_options";
    pub const SAMPLE_DEFAULT: &str = "sample_default";
    pub const GALLERY_SETTINGS_PREFIX: &str = "gallery_settings_";
    pub const PROFILE_NAME: &str = "profile_name";
    pub const PROFILE_EMAIL: &str = "profile_email";
}

pub const DEFAULT_MEASURE_CATEGORIES: &[&str] = &[
    "spores",
    "basidia",
    "cheilocystidia",
    "pleurocystidia",
    "caulocystidia",
    "pileipellis",
    "other",
];

pub const DEFAULT_CONTRAST_OPTIONS: &[&str] = &["BF", "DIC", "Phase", "Oblique"];

pub const DEFAULT_MOUNT_OPTIONS: &[&str] = &["Water", "KOH", "Melzer", "Congo Red", "Cotton Blue"];

pub const DEFAULT_SAMPLE_OPTIONS: &[&str] = &["Fresh", "Dried", "Spore print"];

/// The `app_settings.json` store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppSettings {
    values: Map<String, Value>,
    path: Option<PathBuf>,
}

impl AppSettings {
    /// Empty settings bound to `path` for later saves.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            values: Map::new(),
            path: Some(path.into()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(values) => Ok(Self { values, path: None }),
            _ => Err(ConfigError::NotAnObject),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.values)
    }

    /// Load settings from `path`.
    ///
    /// A missing or unreadable file yields defaults bound to `path`.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("No settings file found at {:?}", path);
            return Self::new(path);
        }
        match std::fs::read_to_string(path) {
            Ok(json) => match Self::from_json(&json) {
                Ok(mut settings) => {
                    log::info!("Loaded settings from {:?}", path);
                    settings.path = Some(path.to_path_buf());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse settings file {:?}: {}", path, e);
                    Self::new(path)
                }
            },
            Err(e) => {
                log::warn!("Failed to read settings file {:?}: {}", path, e);
                Self::new(path)
            }
        }
    }

    /// Write settings back to the file they were loaded from.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::Unbound)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        log::debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A non-empty string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// A list setting, tolerating a JSON-encoded string.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        let value = match self.values.get(key)? {
            Value::String(s) => serde_json::from_str(s).ok()?,
            other => other.clone(),
        };
        let list: Vec<String> = serde_json::from_value(value).ok()?;
        let list: Vec<String> = list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        (!list.is_empty()).then_some(list)
    }

    pub fn set_list(&mut self, key: &str, items: &[String]) {
        self.set(key, Value::from(items.to_vec()));
    }

    fn list_or(&self, key: &str, defaults: &[&str]) -> Vec<String> {
        self.get_list(key)
            .unwrap_or_else(|| defaults.iter().map(|s| s.to_string()).collect())
    }

    /// Measurement categories, spores always first.
    pub fn measure_categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for raw in self.list_or(keys::MEASURE_CATEGORIES, DEFAULT_MEASURE_CATEGORIES) {
            let canonical = crate::model::canonical_measurement_type(Some(&raw));
            if !categories.contains(&canonical) {
                categories.push(canonical);
            }
        }
        if let Some(pos) = categories
            .iter()
            .position(|c| c == crate::model::SPORE_CATEGORY)
        {
            let spores = categories.remove(pos);
            categories.insert(0, spores);
        } else {
            categories.insert(0, crate::model::SPORE_CATEGORY.to_string());
        }
        categories
    }

    pub fn contrast_options(&self) -> Vec<String> {
        self.list_or(keys::CONTRAST_OPTIONS, DEFAULT_CONTRAST_OPTIONS)
    }

    pub fn mount_options(&self) -> Vec<String> {
        self.list_or(keys::MOUNT_OPTIONS, DEFAULT_MOUNT_OPTIONS)
    }

    pub fn sample_options(&self) -> Vec<String> {
        self.list_or(keys::SAMPLE_OPTIONS, DEFAULT_SAMPLE_OPTIONS)
    }

    /// Default for a picker; falls back to the first option.
    fn default_of(&self, key: &str, options: Vec<String>) -> Option<String> {
        self.get_str(key)
            .map(str::to_string)
            .or_else(|| options.into_iter().next())
    }

    pub fn contrast_default(&self) -> Option<String> {
        self.default_of(keys::CONTRAST_DEFAULT, self.contrast_options())
    }

    pub fn mount_default(&self) -> Option<String> {
        self.default_of(keys::MOUNT_DEFAULT, self.mount_options())
    }

    pub fn sample_default(&self) -> Option<String> {
        self.default_of(keys::SAMPLE_DEFAULT, self.sample_options())
    }

    pub fn original_storage_mode(&self) -> OriginalStorageMode {
        match self.get_str(keys::ORIGINAL_STORAGE_MODE) {
            Some(raw) => OriginalStorageMode::parse(raw).unwrap_or_else(|| {
                log::warn!("Unknown original_storage_mode {:?}, using none", raw);
                OriginalStorageMode::None
            }),
            None => OriginalStorageMode::default(),
        }
    }

    pub fn set_original_storage_mode(&mut self, mode: OriginalStorageMode) {
        self.set(keys::ORIGINAL_STORAGE_MODE, mode.as_str());
    }

    pub fn gallery_settings(&self, observation_id: i64) -> Option<&Map<String, Value>> {
        self.values
            .get(&format!("{}{}", keys::GALLERY_SETTINGS_PREFIX, observation_id))
            .and_then(Value::as_object)
    }

    pub fn set_gallery_settings(&mut self, observation_id: i64, settings: Map<String, Value>) {
        self.set(
            &format!("{}{}", keys::GALLERY_SETTINGS_PREFIX, observation_id),
            Value::Object(settings),
        );
    }

    pub fn profile_name(&self) -> Option<&str> {
        self.get_str(keys::PROFILE_NAME)
    }

    pub fn last_export_dir(&self) -> Option<PathBuf> {
        self.get_str(keys::LAST_EXPORT_DIR).map(PathBuf::from)
    }
}

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// JSON parsing error
    #[error("Failed to parse settings: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Settings file must contain a JSON object")]
    NotAnObject,

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    /// Settings were built in memory and have no file to save to
    #[error("Settings are not bound to a file")]
    Unbound,

    #[error("Could not determine a data directory")]
    NoDataDir,

    /// I/O error when reading/writing settings
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_level_filter(), log::LevelFilter::Trace);
    }

    #[test]
    fn test_paths_layout() {
        let paths = AppPaths::new("/data/MycoLog");
        assert_eq!(paths.database(), PathBuf::from("/data/MycoLog/mushrooms.db"));
        assert_eq!(
            paths.reference_database(),
            PathBuf::from("/data/MycoLog/reference_values.db")
        );
        assert_eq!(paths.images_dir(), PathBuf::from("/data/MycoLog/images"));

        let mut settings = AppSettings::default();
        settings.set(keys::IMAGES_DIR, "/mnt/photos");
        let resolved = paths.with_settings(&settings);
        assert_eq!(resolved.images_dir, PathBuf::from("/mnt/photos"));
        assert_eq!(resolved.database, paths.database());
    }

    #[test]
    fn test_measure_categories_fallback() {
        let settings = AppSettings::default();
        let categories = settings.measure_categories();
        assert_eq!(categories[0], "spores");
        assert_eq!(categories.len(), DEFAULT_MEASURE_CATEGORIES.len());

        let mut settings = AppSettings::default();
        settings.set(
            keys::MEASURE_CATEGORIES,
            r#"["Basidia", "spore", "manual", ""]"#,
        );
        assert_eq!(settings.measure_categories(), vec!["spores", "Basidia"]);

        settings.set(keys::MEASURE_CATEGORIES, Value::Array(vec![]));
        assert_eq!(
            settings.measure_categories().len(),
            DEFAULT_MEASURE_CATEGORIES.len()
        );
    }

    #[test]
    fn test_original_storage_mode() {
        let mut settings = AppSettings::default();
        assert_eq!(settings.original_storage_mode(), OriginalStorageMode::None);
        settings.set_original_storage_mode(OriginalStorageMode::Global);
        assert_eq!(settings.original_storage_mode(), OriginalStorageMode::Global);
        settings.set(keys::ORIGINAL_STORAGE_MODE, "sideways");
        assert_eq!(settings.original_storage_mode(), OriginalStorageMode::None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app_settings.json");
        let mut settings = AppSettings::load(&path);
        settings.set(keys::PROFILE_NAME, "A. Mycologist");
        settings.set("custom_key", 3);
        let mut gallery = Map::new();
        gallery.insert("columns".into(), Value::from(4));
        settings.set_gallery_settings(12, gallery);
        settings.save().unwrap();

        let loaded = AppSettings::load(&path);
        assert_eq!(loaded.profile_name(), Some("A. Mycologist"));
        assert_eq!(loaded.get("custom_key"), Some(&Value::from(3)));
        assert_eq!(
            loaded.gallery_settings(12).unwrap().get("columns"),
            Some(&Value::from(4))
        );
        assert_eq!(loaded.mount_default().as_deref(), Some("Water"));
    }

    #[test]
    fn test_bad_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_settings.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        let settings = AppSettings::load(&path);
        assert!(settings.get(keys::PROFILE_NAME).is_none());
        assert!(matches!(
            AppSettings::from_json("[]"),
            Err(ConfigError::NotAnObject)
        ));
        assert!(matches!(AppSettings::default().save(), Err(ConfigError::Unbound)));
    }
}
