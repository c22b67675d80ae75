//! Which species have measured spores or literature ranges.
//!
//! The index is built on first use and dropped by [`AvailabilityIndex::invalidate`]
//! whenever taxonomy, measurements, sources or reference values change.

use std::collections::{BTreeSet, HashMap};

use crate::db::Database;
use crate::error::Result;
use crate::model::{SourceType, is_spore_type};
use crate::reference::ReferenceStore;

/// Appended to a species name when measured points exist.
pub const POINT_MARKER: &str = "\u{1F535}";
/// Appended when a literature range exists.
pub const RANGE_MARKER: &str = "\u{1F4CF}";

/// Observation ids per source type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSets {
    pub personal: BTreeSet<i64>,
    pub shared: BTreeSet<i64>,
    pub published: BTreeSet<i64>,
}

impl SourceSets {
    pub fn get(&self, source: SourceType) -> &BTreeSet<i64> {
        match source {
            SourceType::Personal => &self.personal,
            SourceType::Shared => &self.shared,
            SourceType::Published => &self.published,
        }
    }

    fn get_mut(&mut self, source: SourceType) -> &mut BTreeSet<i64> {
        match source {
            SourceType::Personal => &mut self.personal,
            SourceType::Shared => &mut self.shared,
            SourceType::Published => &mut self.published,
        }
    }

    fn remove(&mut self, observation_id: i64) {
        self.personal.remove(&observation_id);
        self.shared.remove(&observation_id);
        self.published.remove(&observation_id);
    }
}

/// What is known about one species.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeciesInfo {
    pub obs_ids_by_source: SourceSets,
    pub measurement_count: usize,
    pub has_reference_minmax: bool,
}

impl SpeciesInfo {
    pub fn count(&self, source: SourceType) -> usize {
        self.obs_ids_by_source.get(source).len()
    }

    pub fn has_personal_points(&self) -> bool {
        self.count(SourceType::Personal) > 0
    }

    pub fn has_shared_points(&self) -> bool {
        self.count(SourceType::Shared) > 0
    }

    pub fn has_published_points(&self) -> bool {
        self.count(SourceType::Published) > 0
    }

    pub fn has_points(&self) -> bool {
        self.has_personal_points() || self.has_shared_points() || self.has_published_points()
    }

    pub fn has_any_data(&self) -> bool {
        self.has_points() || self.has_reference_minmax
    }
}

/// `(genus, species)`, trimmed.
pub type SpeciesKey = (String, String);

fn key(genus: &str, species: &str) -> SpeciesKey {
    (genus.trim().to_string(), species.trim().to_string())
}

/// Lazily built species availability cache.
#[derive(Debug, Default)]
pub struct AvailabilityIndex {
    entries: Option<HashMap<SpeciesKey, SpeciesInfo>>,
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cache; the next lookup rebuilds it.
    pub fn invalidate(&mut self) {
        if self.entries.take().is_some() {
            log::debug!("Availability index invalidated");
        }
    }

    pub fn is_built(&self) -> bool {
        self.entries.is_some()
    }

    /// Scan the stores into a fresh map.
    pub fn build(db: &Database, references: &ReferenceStore) -> Result<HashMap<SpeciesKey, SpeciesInfo>> {
        let mut entries: HashMap<SpeciesKey, SpeciesInfo> = HashMap::new();
        let mut stmt = db.connection().prepare(
            "SELECT o.id, o.genus, o.species, o.source_type, m.measurement_type
             FROM observations o
             JOIN images i ON i.observation_id = o.id
             JOIN measurements m ON m.image_id = i.id
             WHERE m.length_um IS NOT NULL AND o.genus IS NOT NULL AND o.species IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        for row in rows {
            let (obs_id, genus, species, source, measurement_type) = row?;
            if genus.trim().is_empty()
                || species.trim().is_empty()
                || !is_spore_type(measurement_type.as_deref())
            {
                continue;
            }
            let info = entries.entry(key(&genus, &species)).or_default();
            info.obs_ids_by_source
                .get_mut(SourceType::parse(source.as_deref().unwrap_or("")))
                .insert(obs_id);
            info.measurement_count += 1;
        }

        for values in references.list_all()? {
            if values.has_minmax() {
                entries
                    .entry(key(&values.genus, &values.species))
                    .or_default()
                    .has_reference_minmax = true;
            }
        }
        log::debug!("Availability index built with {} species", entries.len());
        Ok(entries)
    }

    fn ensure(
        &mut self,
        db: &Database,
        references: &ReferenceStore,
    ) -> Result<&HashMap<SpeciesKey, SpeciesInfo>> {
        let entries = match self.entries.take() {
            Some(entries) => entries,
            None => Self::build(db, references)?,
        };
        Ok(&*self.entries.insert(entries))
    }

    /// Full info for a species, without the given observation's own points.
    pub fn detailed(
        &mut self,
        db: &Database,
        references: &ReferenceStore,
        genus: &str,
        species: &str,
        exclude_observation_id: Option<i64>,
    ) -> Result<SpeciesInfo> {
        let entries = self.ensure(db, references)?;
        let mut info = entries
            .get(&key(genus, species))
            .cloned()
            .unwrap_or_default();
        if let Some(id) = exclude_observation_id {
            info.obs_ids_by_source.remove(id);
        }
        Ok(info)
    }

    /// `"Genus species"` plus markers, and whether any data exists.
    pub fn display_name(
        &mut self,
        db: &Database,
        references: &ReferenceStore,
        genus: &str,
        species: &str,
        exclude_observation_id: Option<i64>,
    ) -> Result<(String, bool)> {
        let info = self.detailed(db, references, genus, species, exclude_observation_id)?;
        let mut name = format!("{} {}", genus.trim(), species.trim());
        if info.has_points() {
            name.push(' ');
            name.push_str(POINT_MARKER);
        }
        if info.has_reference_minmax {
            name.push(' ');
            name.push_str(RANGE_MARKER);
        }
        Ok((name, info.has_any_data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageRecord, ImageType, NewMeasurement, ObservationDraft, ReferenceValues};

    fn observation_with_spores(db: &Database, source: SourceType, count: usize) -> i64 {
        let obs = db
            .insert_observation(
                &ObservationDraft::new("2024-09-01 09:00")
                    .with_taxon("Amanita", "muscaria")
                    .with_source(source),
                None,
            )
            .unwrap();
        let image = db
            .insert_image(&ImageRecord {
                observation_id: Some(obs),
                scale_microns_per_pixel: Some(0.0315),
                ..ImageRecord::new(format!("/img/{}.jpg", obs), ImageType::Microscope)
            })
            .unwrap();
        for i in 0..count {
            db.add_measurement(image, &NewMeasurement::new(8.0 + i as f64, Some(6.0)))
                .unwrap();
        }
        obs
    }

    #[test]
    fn test_display_name_with_points_and_range() {
        let db = Database::open_in_memory().unwrap();
        let mut refs = ReferenceStore::open_in_memory().unwrap();
        observation_with_spores(&db, SourceType::Personal, 3);
        let mut values = ReferenceValues::new("Amanita", "muscaria");
        values.length_min = Some(7.0);
        values.length_max = Some(9.0);
        refs.upsert(&values).unwrap();

        let mut index = AvailabilityIndex::new();
        let (name, has_data) = index
            .display_name(&db, &refs, "Amanita", "muscaria", None)
            .unwrap();
        assert_eq!(name, format!("Amanita muscaria {} {}", POINT_MARKER, RANGE_MARKER));
        assert!(has_data);

        let info = index
            .detailed(&db, &refs, "Amanita", "muscaria", None)
            .unwrap();
        assert!(info.has_personal_points());
        assert_eq!(info.count(SourceType::Personal), 1);
        assert_eq!(info.measurement_count, 3);
        assert!(info.has_reference_minmax);
    }

    #[test]
    fn test_exclusion_and_invalidation() {
        let db = Database::open_in_memory().unwrap();
        let refs = ReferenceStore::open_in_memory().unwrap();
        let own = observation_with_spores(&db, SourceType::Personal, 2);

        let mut index = AvailabilityIndex::new();
        let (name, has_data) = index
            .display_name(&db, &refs, "Amanita", "muscaria", Some(own))
            .unwrap();
        assert_eq!(name, "Amanita muscaria");
        assert!(!has_data);

        observation_with_spores(&db, SourceType::Shared, 1);
        let stale = index
            .detailed(&db, &refs, "Amanita", "muscaria", None)
            .unwrap();
        assert!(!stale.has_shared_points());

        index.invalidate();
        let fresh = index
            .detailed(&db, &refs, "Amanita", "muscaria", None)
            .unwrap();
        assert!(fresh.has_shared_points());
        assert!(fresh.has_points());
    }

    #[test]
    fn test_non_spore_measurements_ignored() {
        let db = Database::open_in_memory().unwrap();
        let refs = ReferenceStore::open_in_memory().unwrap();
        let obs = observation_with_spores(&db, SourceType::Published, 0);
        let image = db.images_for_observation(obs).unwrap()[0].id;
        db.add_measurement(image, &NewMeasurement::new(30.0, None).with_type("basidia"))
            .unwrap();
        let mut index = AvailabilityIndex::new();
        let info = index
            .detailed(&db, &refs, "Amanita", "muscaria", None)
            .unwrap();
        assert_eq!(info, SpeciesInfo::default());
    }
}
