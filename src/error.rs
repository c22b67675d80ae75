//! Error types for the measurement workbench.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in storage, calibration, measurement and export operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error from the main or reference store
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Archive read/write error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Image decoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Settings or data directory problem
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Rejected input (non-positive scale, bad coordinates, unknown objective...)
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of what was wrong
        message: String,
    },

    /// A measurement was attempted on an image without a resolved scale
    #[error("No scale set for image {image_id}")]
    ScaleUnresolved {
        /// Image that has no usable µm/px
        image_id: i64,
    },

    /// Row lookup by id failed
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("observation", "image", ...)
        entity: &'static str,
        /// The id that was looked up
        id: i64,
    },

    /// A bundle archive lacks a required member
    #[error("Bundle is missing required entry '{name}'")]
    MissingBundleEntry {
        /// Archive member name
        name: String,
    },

    /// A file expected on disk does not exist
    #[error("File not found: {path:?}")]
    FileNotFound {
        /// Path where the file was expected
        path: PathBuf,
    },

    /// A long-running operation observed its cancel flag
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an invalid input error with a message.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether this error is a transient SQLite lock conflict.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}
