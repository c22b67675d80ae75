//! Literature reference values for a species.

use serde::{Deserialize, Serialize};

/// Distribution percentiles for one (genus, species, source, mount medium).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceValues {
    pub id: Option<i64>,
    pub genus: String,
    pub species: String,
    pub source: Option<String>,
    pub mount_medium: Option<String>,
    pub length_min: Option<f64>,
    pub length_p05: Option<f64>,
    pub length_p50: Option<f64>,
    pub length_p95: Option<f64>,
    pub length_max: Option<f64>,
    pub length_avg: Option<f64>,
    pub width_min: Option<f64>,
    pub width_p05: Option<f64>,
    pub width_p50: Option<f64>,
    pub width_p95: Option<f64>,
    pub width_max: Option<f64>,
    pub width_avg: Option<f64>,
    pub q_min: Option<f64>,
    pub q_p50: Option<f64>,
    pub q_max: Option<f64>,
    pub q_avg: Option<f64>,
    pub updated_at: Option<String>,
}

impl ReferenceValues {
    pub fn new(genus: impl Into<String>, species: impl Into<String>) -> Self {
        Self {
            genus: genus.into(),
            species: species.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_mount(mut self, mount_medium: impl Into<String>) -> Self {
        self.mount_medium = Some(mount_medium.into());
        self
    }

    /// Whether any percentile or extremum is present.
    pub fn has_minmax(&self) -> bool {
        [
            self.length_min,
            self.length_p05,
            self.length_p50,
            self.length_p95,
            self.length_max,
            self.width_min,
            self.width_p05,
            self.width_p50,
            self.width_p95,
            self.width_max,
            self.q_min,
            self.q_p50,
            self.q_max,
        ]
        .iter()
        .any(Option::is_some)
    }
}
