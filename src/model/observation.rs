//! Observation data model: one real-world collection event.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where the data behind an observation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Collected by the user
    #[default]
    Personal,
    /// Shared by another mycologist
    Shared,
    /// Taken from a publication
    Published,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Personal => "personal",
            SourceType::Shared => "shared",
            SourceType::Published => "published",
        }
    }

    /// Parse a stored value; unknown or empty values mean personal.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => SourceType::Shared,
            "published" => SourceType::Published,
            _ => SourceType::Personal,
        }
    }

    pub fn all() -> &'static [SourceType] {
        &[SourceType::Personal, SourceType::Shared, SourceType::Published]
    }
}

/// A stored observation row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    /// Collection date/time, `YYYY-MM-DD HH:MM`.
    pub date: String,
    pub location: Option<String>,
    pub habitat: Option<String>,
    pub notes: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    /// Working title shown while the observation is unidentified.
    pub species_guess: Option<String>,
    pub uncertain: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub author: Option<String>,
    pub source_type: SourceType,
    pub citation: Option<String>,
    pub data_provider: Option<String>,
    pub folder_path: Option<PathBuf>,
    /// Cached literature string for the observation's spores.
    pub spore_statistics: Option<String>,
    /// Learned auto-measure edge threshold in [0.02, 0.6].
    pub auto_threshold: Option<f64>,
    /// Largest spore radius auto-measure has seen (pixels).
    pub auto_max_radius: Option<f64>,
    pub created_at: Option<String>,
}

impl Observation {
    /// `"Genus species"` when both parts are present.
    pub fn scientific_name(&self) -> Option<String> {
        match (non_empty(&self.genus), non_empty(&self.species)) {
            (Some(g), Some(s)) => Some(format!("{} {}", g, s)),
            _ => None,
        }
    }
}

/// Fields supplied when creating or editing an observation.
#[derive(Debug, Clone, Default)]
pub struct ObservationDraft {
    pub date: String,
    pub location: Option<String>,
    pub habitat: Option<String>,
    pub notes: Option<String>,
    pub genus: Option<String>,
    pub species: Option<String>,
    /// Explicit working title; regenerated from taxonomy when `None`.
    pub species_guess: Option<String>,
    pub uncertain: bool,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    pub author: Option<String>,
    pub source_type: SourceType,
    pub citation: Option<String>,
    pub data_provider: Option<String>,
}

impl ObservationDraft {
    pub fn new(date: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            ..Self::default()
        }
    }

    pub fn with_taxon(mut self, genus: impl Into<String>, species: impl Into<String>) -> Self {
        self.genus = Some(genus.into());
        self.species = Some(species.into());
        self
    }

    pub fn with_source(mut self, source: SourceType) -> Self {
        self.source_type = source;
        self
    }

    /// The working title to store for this draft.
    pub fn resolved_species_guess(&self) -> String {
        if let Some(guess) = non_empty(&self.species_guess) {
            return guess.to_string();
        }
        generated_species_guess(self.genus.as_deref(), self.species.as_deref())
    }
}

impl From<&Observation> for ObservationDraft {
    fn from(obs: &Observation) -> Self {
        Self {
            date: obs.date.clone(),
            location: obs.location.clone(),
            habitat: obs.habitat.clone(),
            notes: obs.notes.clone(),
            genus: obs.genus.clone(),
            species: obs.species.clone(),
            species_guess: None,
            uncertain: obs.uncertain,
            gps_latitude: obs.gps_latitude,
            gps_longitude: obs.gps_longitude,
            author: obs.author.clone(),
            source_type: obs.source_type,
            citation: obs.citation.clone(),
            data_provider: obs.data_provider.clone(),
        }
    }
}

/// Working title derived from the taxonomy: `Genus species`, `Genus sp.` or `Unknown`.
pub fn generated_species_guess(genus: Option<&str>, species: Option<&str>) -> String {
    let genus = genus.map(str::trim).filter(|s| !s.is_empty());
    let species = species.map(str::trim).filter(|s| !s.is_empty());
    match (genus, species) {
        (Some(g), Some(s)) => format!("{} {}", g, s),
        (Some(g), None) => format!("{} sp.", g),
        _ => "Unknown".to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_parse() {
        assert_eq!(SourceType::parse("shared"), SourceType::Shared);
        assert_eq!(SourceType::parse("Published"), SourceType::Published);
        assert_eq!(SourceType::parse(""), SourceType::Personal);
        assert_eq!(SourceType::parse("garbage"), SourceType::Personal);
        for source in SourceType::all() {
            assert_eq!(SourceType::parse(source.as_str()), *source);
        }
    }

    #[test]
    fn test_species_guess_generation() {
        assert_eq!(generated_species_guess(Some("Amanita"), Some("muscaria")), "Amanita muscaria");
        assert_eq!(generated_species_guess(Some("Amanita"), Some(" ")), "Amanita sp.");
        assert_eq!(generated_species_guess(None, Some("muscaria")), "Unknown");

        let draft = ObservationDraft::new("2024-09-01 10:00").with_taxon("Russula", "emetica");
        assert_eq!(draft.resolved_species_guess(), "Russula emetica");

        let mut explicit = draft.clone();
        explicit.species_guess = Some("Red brittlegill".into());
        assert_eq!(explicit.resolved_species_guess(), "Red brittlegill");
    }
}
