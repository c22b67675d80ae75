//! The measurement workbench: every store and cache behind one owner.
//!
//! Mutations go through here so the derived state stays consistent:
//! - the species availability index is dropped whenever measurements,
//!   observations or reference values change
//! - the cached statistics string of an observation is rewritten whenever
//!   its measurements change
//! - the active calibration index and the objective catalog follow
//!   calibration activation and deletion

use std::path::{Path, PathBuf};

use crate::automeasure::{AutoMeasureOutcome, AutoMeasureParams, AutoMeasurement, auto_measure, updated_max_radius};
use crate::availability::{AvailabilityIndex, SpeciesInfo};
use crate::bundle::{BundleRoots, ExportSummary, ImportSummary, IncludeFlags, Reporter};
use crate::calibration::{ScaleBar, apply_custom_scale};
use crate::catalog::{Catalog, RemovedFiles, ThumbnailGenerator};
use crate::config::{AppPaths, AppSettings, OriginalStorageMode};
use crate::db::{Database, SpeciesFilter};
use crate::error::{Error, Result};
use crate::geometry::{MeasurementShape, Point};
use crate::ml_export::{DatasetWriter, ExportStats, MlExportOptions};
use crate::model::{
    CUSTOM_OBJECTIVE, Calibration, ImageRecord, NewCalibration, NewImage, NewMeasurement,
    ObservationDraft, ReferenceValues,
};
use crate::reference::ReferenceStore;
use crate::rescale::{RescalePlan, RescaleSummary};
use crate::scale::{ActiveCalibrations, ObjectiveCatalog, ScaleResolution, ScaleResolver, ScaleStatus};
use crate::stats::SporeStatistics;

/// Owner of the stores, the objective catalog and the derived caches.
pub struct Workbench {
    paths: AppPaths,
    settings: AppSettings,
    db: Database,
    references: ReferenceStore,
    objectives: ObjectiveCatalog,
    active: ActiveCalibrations,
    availability: AvailabilityIndex,
    catalog: Catalog,
}

impl Workbench {
    /// Open (creating when needed) everything under `paths`.
    pub fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let settings = AppSettings::load(&paths.settings());
        let resolved = paths.with_settings(&settings);
        let db = Database::open(&resolved.database)?;
        let references = ReferenceStore::open(&paths.reference_database())?;
        let mut objectives = ObjectiveCatalog::load_or_seed(&paths.objectives())?;
        let active = ActiveCalibrations::load(&db)?;
        let synced = objectives.sync_from(&active);
        if !synced.is_empty() {
            log::info!("Objectives updated from active calibrations: {:?}", synced);
            objectives.save()?;
        }
        let catalog = Catalog::new(
            resolved.images_dir,
            resolved.originals_dir,
            paths.thumbnails_dir(),
            settings.original_storage_mode(),
        );
        log::info!("Workbench opened in {:?}", paths.data_dir);
        Ok(Self {
            paths,
            settings,
            db,
            references,
            objectives,
            active,
            availability: AvailabilityIndex::new(),
            catalog,
        })
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn references(&self) -> &ReferenceStore {
        &self.references
    }

    pub fn objectives(&self) -> &ObjectiveCatalog {
        &self.objectives
    }

    pub fn active_calibrations(&self) -> &ActiveCalibrations {
        &self.active
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Change where full-resolution originals go and persist the choice.
    pub fn set_original_storage_mode(&mut self, mode: OriginalStorageMode) -> Result<()> {
        self.settings.set_original_storage_mode(mode);
        self.settings.save()?;
        self.catalog.set_storage_mode(mode);
        Ok(())
    }

    /// Drop caches derived from measurements and references.
    pub fn invalidate_caches(&mut self) {
        self.availability.invalidate();
    }

    // ========================================================================
    // Observations and images
    // ========================================================================

    pub fn create_observation(&mut self, draft: &ObservationDraft) -> Result<i64> {
        let id = self.catalog.create_observation(&self.db, draft)?;
        self.availability.invalidate();
        Ok(id)
    }

    /// Save edited observation fields, moving its folder when the taxonomy
    /// or date changed. Returns the folder the observation ends up in.
    pub fn update_observation(&mut self, id: i64, draft: &ObservationDraft) -> Result<PathBuf> {
        let folder = self.catalog.update_observation(&mut self.db, id, draft)?;
        self.availability.invalidate();
        Ok(folder)
    }

    pub fn delete_observation(&mut self, id: i64) -> Result<RemovedFiles> {
        let removed = self.catalog.delete_observation(&mut self.db, id)?;
        self.availability.invalidate();
        Ok(removed)
    }

    /// Attach an image. A catalog objective without an explicit calibration
    /// is bound to that objective's active calibration.
    pub fn add_image(&mut self, observation_id: i64, new: &NewImage) -> Result<i64> {
        crate::scale::validate_objective_key(&self.objectives, new.objective_name.as_deref())?;
        let mut new = new.clone();
        if new.calibration_id.is_none() {
            if let Some(active) = new
                .objective_name
                .as_deref()
                .filter(|key| *key != CUSTOM_OBJECTIVE)
                .and_then(|key| self.active.get(key))
            {
                new.calibration_id = Some(active.id);
                if new.scale_microns_per_pixel.is_none() {
                    new.scale_microns_per_pixel = Some(active.microns_per_pixel / new.resample_scale_factor);
                }
            }
        }
        self.catalog.add_image(&self.db, observation_id, &new)
    }

    pub fn delete_image(&mut self, image_id: i64) -> Result<RemovedFiles> {
        let observation = self.db.require_image(image_id)?.observation_id;
        let removed = self.catalog.delete_image(&mut self.db, image_id)?;
        if let Some(observation) = observation {
            self.refresh_statistics(observation)?;
        }
        self.availability.invalidate();
        Ok(removed)
    }

    pub fn generate_thumbnails(&self, generator: &dyn ThumbnailGenerator, image_id: i64) -> Result<usize> {
        self.catalog.generate_thumbnails(&self.db, generator, image_id)
    }

    // ========================================================================
    // Scale
    // ========================================================================

    /// The calibration an image points at, `None` when unset or deleted.
    pub fn calibration_for(&self, image: &ImageRecord) -> Result<Option<Calibration>> {
        let Some(id) = image.calibration_id else {
            return Ok(None);
        };
        let calibration = self.db.get_calibration(id)?;
        if calibration.is_none() {
            log::debug!("Image {} references deleted calibration {}", image.id, id);
        }
        Ok(calibration)
    }

    fn resolver(&self) -> ScaleResolver<'_> {
        ScaleResolver::new(&self.objectives, &self.active)
    }

    /// Effective µm/px of an image, with advisory warnings.
    pub fn resolve_scale(&self, image_id: i64) -> Result<Option<ScaleResolution>> {
        let image = self.db.require_image(image_id)?;
        let calibration = self.calibration_for(&image)?;
        let size = image::image_dimensions(&image.filepath).ok();
        Ok(self.resolver().resolve(&image, calibration.as_ref(), size))
    }

    fn require_scale(&self, image: &ImageRecord) -> Result<f64> {
        let calibration = self.calibration_for(image)?;
        Ok(self
            .resolver()
            .require(image, calibration.as_ref(), None)?
            .microns_per_pixel)
    }

    pub fn scale_status(&self, image_id: i64) -> Result<ScaleStatus> {
        let image = self.db.require_image(image_id)?;
        let calibration = self.calibration_for(&image)?;
        Ok(self.resolver().status(&image, calibration.as_ref()))
    }

    /// Set a scale-bar scale on an image. The returned plan recomputes the
    /// image's four-point measurements and is applied by
    /// [`Workbench::apply_rescale`] once confirmed.
    pub fn set_custom_scale(&mut self, image_id: i64, bar: &ScaleBar) -> Result<(f64, Option<RescalePlan>)> {
        let effective = self.resolve_scale(image_id)?.map(|r| r.microns_per_pixel);
        apply_custom_scale(&self.db, image_id, bar, effective)
    }

    /// Apply a confirmed per-image rescale.
    pub fn apply_rescale(&mut self, image_id: i64, plan: &RescalePlan) -> Result<usize> {
        let updated = plan.apply(&mut self.db)?;
        if let Some(observation) = self.db.require_image(image_id)?.observation_id {
            self.refresh_statistics(observation)?;
        }
        self.availability.invalidate();
        Ok(updated)
    }

    /// Change an objective's nominal scale, scaling bound measurements.
    pub fn rescale_objective(&mut self, objective_key: &str, new_scale: f64) -> Result<RescaleSummary> {
        let summary = crate::rescale::rescale_objective(&mut self.db, &mut self.objectives, objective_key, new_scale)?;
        self.objectives.save()?;
        self.refresh_all_statistics()?;
        Ok(summary)
    }

    // ========================================================================
    // Measurements
    // ========================================================================

    /// Store a drawn measurement at the image's resolved scale.
    pub fn add_measurement(
        &mut self,
        image_id: i64,
        shape: MeasurementShape,
        measurement_type: Option<&str>,
    ) -> Result<i64> {
        let image = self.db.require_image(image_id)?;
        let mpp = self.require_scale(&image)?;
        let mut new = NewMeasurement::from_shape(shape, mpp)
            .ok_or_else(|| Error::invalid_input("measurement lines are too short"))?;
        new.measurement_type = measurement_type.map(str::to_string);
        let id = self.db.add_measurement(image_id, &new)?;
        self.measurements_changed(image.observation_id)?;
        Ok(id)
    }

    /// Replace the geometry of a measurement after a preview edit.
    pub fn update_measurement(&mut self, id: i64, shape: MeasurementShape) -> Result<()> {
        let measurement = self
            .db
            .get_measurement(id)?
            .ok_or_else(|| Error::not_found("measurement", id))?;
        let image = self.db.require_image(measurement.image_id)?;
        let mpp = self.require_scale(&image)?;
        let dims = shape
            .dimensions(mpp)
            .ok_or_else(|| Error::invalid_input("measurement lines are too short"))?;
        let notes = dims.q_note().or(measurement.notes);
        self.db
            .update_points_and_dimensions(id, dims.length_um, dims.width_um, notes.as_deref(), &shape)?;
        self.measurements_changed(image.observation_id)
    }

    pub fn delete_measurement(&mut self, id: i64) -> Result<()> {
        let measurement = self
            .db
            .get_measurement(id)?
            .ok_or_else(|| Error::not_found("measurement", id))?;
        let observation = self.db.require_image(measurement.image_id)?.observation_id;
        self.db.delete_measurement(id)?;
        self.measurements_changed(observation)
    }

    /// Index of the measurement under `point` on an image.
    pub fn measurement_at(&self, image_id: i64, point: Point, tolerance: f64) -> Result<Option<i64>> {
        let measurements = self.db.measurements_for_image(image_id)?;
        let shapes: Vec<(usize, MeasurementShape)> = measurements
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.shape().map(|s| (i, s)))
            .collect();
        let hit = crate::geometry::hit_test(shapes.iter().map(|(_, s)| s), &point, tolerance);
        Ok(hit.map(|h| measurements[shapes[h].0].id))
    }

    /// Detect the spore under `click` with the observation's learned
    /// parameters.
    pub fn auto_measure(&self, image_id: i64, click: Point) -> Result<AutoMeasureOutcome> {
        let image = self.db.require_image(image_id)?;
        self.require_scale(&image)?;
        let params = match image.observation_id {
            Some(id) => {
                let obs = self.db.require_observation(id)?;
                AutoMeasureParams {
                    threshold: obs.auto_threshold,
                    max_radius: obs.auto_max_radius,
                }
            }
            None => AutoMeasureParams::default(),
        };
        let gray = image::open(&image.filepath)?.to_luma8();
        Ok(auto_measure(&gray, click, &params))
    }

    /// Store an accepted detection and learn from it.
    pub fn save_auto_measurement(&mut self, image_id: i64, detected: &AutoMeasurement) -> Result<i64> {
        let image = self.db.require_image(image_id)?;
        let mpp = self.require_scale(&image)?;
        let new = NewMeasurement::from_shape(detected.shape, mpp)
            .ok_or_else(|| Error::invalid_input("detected spore is degenerate"))?;
        let id = self.db.add_measurement(image_id, &new)?;
        if let Some(observation_id) = image.observation_id {
            let obs = self.db.require_observation(observation_id)?;
            self.db
                .set_auto_threshold(observation_id, detected.learned_threshold())?;
            self.db.set_auto_max_radius(
                observation_id,
                updated_max_radius(obs.auto_max_radius, detected.largest_radius()),
            )?;
        }
        self.measurements_changed(image.observation_id)?;
        Ok(id)
    }

    fn measurements_changed(&mut self, observation_id: Option<i64>) -> Result<()> {
        if let Some(id) = observation_id {
            self.refresh_statistics(id)?;
        }
        self.availability.invalidate();
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn observation_statistics(&self, observation_id: i64) -> Result<Option<SporeStatistics>> {
        let measurements = self.db.measurements_for_observation(observation_id)?;
        Ok(SporeStatistics::from_measurements(&measurements))
    }

    /// Rewrite the cached literature string of an observation.
    pub fn refresh_statistics(&mut self, observation_id: i64) -> Result<Option<SporeStatistics>> {
        let stats = self.observation_statistics(observation_id)?;
        let summary = stats.as_ref().map(SporeStatistics::literature_string);
        self.db
            .update_spore_statistics(observation_id, summary.as_deref());
        Ok(stats)
    }

    fn refresh_all_statistics(&mut self) -> Result<()> {
        for obs in self.db.list_observations()? {
            self.refresh_statistics(obs.id)?;
        }
        self.availability.invalidate();
        Ok(())
    }

    // ========================================================================
    // Calibrations
    // ========================================================================

    /// Store a calibration for a catalog objective, activating it when asked.
    pub fn add_calibration(&mut self, new: &NewCalibration) -> Result<i64> {
        if new.objective_key == CUSTOM_OBJECTIVE || !self.objectives.contains(&new.objective_key) {
            return Err(Error::invalid_input(format!(
                "cannot calibrate unknown objective {:?}",
                new.objective_key
            )));
        }
        let id = self.db.add_calibration(new)?;
        if new.set_active {
            self.activate_calibration(id)?;
        }
        Ok(id)
    }

    /// Make a calibration the active one for its objective and copy its
    /// scale into the catalog.
    ///
    /// Images of that objective without a calibration row resolve through
    /// the catalog, so their measurements are rescaled with it; the summary
    /// is `None` when the catalog value did not change.
    pub fn activate_calibration(&mut self, id: i64) -> Result<(Calibration, Option<RescaleSummary>)> {
        let calibration = self.db.set_active_calibration(id)?;
        self.active.activate(calibration.clone());
        let rescaled = self.sync_catalog(&calibration.objective_key)?;
        log::info!(
            "Calibration {} active for {} at {:.5} µm/px",
            id,
            calibration.objective_key,
            calibration.microns_per_pixel
        );
        Ok((calibration, rescaled))
    }

    /// Change a calibration's µm/px and rescale every measurement that
    /// depends on it. An active calibration also moves the catalog value.
    pub fn update_calibration_scale(&mut self, id: i64, microns_per_pixel: f64) -> Result<RescaleSummary> {
        if !(microns_per_pixel > 0.0) || !microns_per_pixel.is_finite() {
            return Err(Error::invalid_input(format!(
                "calibration scale must be positive, got {}",
                microns_per_pixel
            )));
        }
        let old = self.db.set_calibration_scale(id, microns_per_pixel)?;
        let summary = crate::rescale::rescale_calibration(&mut self.db, id, old, microns_per_pixel)?;
        let calibration = self
            .db
            .get_calibration(id)?
            .ok_or_else(|| Error::not_found("calibration", id))?;
        if calibration.is_active {
            self.active.activate(calibration.clone());
            self.sync_catalog(&calibration.objective_key)?;
        }
        self.refresh_all_statistics()?;
        Ok(summary)
    }

    /// Copy active calibrations into the catalog, rescaling the images that
    /// take their scale from `objective_key`'s catalog entry.
    fn sync_catalog(&mut self, objective_key: &str) -> Result<Option<RescaleSummary>> {
        let before = self.objectives.get(objective_key).map(|o| o.microns_per_pixel);
        if self.objectives.sync_from(&self.active).is_empty() {
            return Ok(None);
        }
        self.objectives.save()?;
        let after = self.objectives.get(objective_key).map(|o| o.microns_per_pixel);
        let (Some(old), Some(new)) = (before, after) else {
            return Ok(None);
        };
        if !(old > 0.0) || old == new {
            return Ok(None);
        }
        let summary = crate::rescale::rescale_catalog_objective(&mut self.db, objective_key, old, new)?;
        if summary.measurements > 0 {
            self.refresh_all_statistics()?;
        }
        Ok(Some(summary))
    }

    /// Delete a calibration and its stored image.
    pub fn delete_calibration(&mut self, id: i64) -> Result<Calibration> {
        let calibrations_dir = self.paths.calibrations_dir();
        let (calibration, _) =
            crate::calibration::delete_calibration(&self.db, id, &[calibrations_dir.as_path()])?;
        self.active.forget(id);
        self.active.reload(&self.db)?;
        Ok(calibration)
    }

    // ========================================================================
    // Reference values and species availability
    // ========================================================================

    pub fn upsert_reference(&mut self, values: &ReferenceValues) -> Result<i64> {
        let id = self.references.upsert(values)?;
        self.availability.invalidate();
        Ok(id)
    }

    /// Summarize stored spore measurements of a species into reference values.
    pub fn reference_from_measurements(
        &self,
        genus: &str,
        species: &str,
        filter: &SpeciesFilter,
    ) -> Result<Option<ReferenceValues>> {
        let measurements = self.db.measurements_for_species(genus, species, filter)?;
        Ok(ReferenceValues::from_measurements(genus, species, &measurements))
    }

    pub fn species_info(
        &mut self,
        genus: &str,
        species: &str,
        exclude_observation_id: Option<i64>,
    ) -> Result<SpeciesInfo> {
        self.availability
            .detailed(&self.db, &self.references, genus, species, exclude_observation_id)
    }

    pub fn species_display_name(
        &mut self,
        genus: &str,
        species: &str,
        exclude_observation_id: Option<i64>,
    ) -> Result<(String, bool)> {
        self.availability
            .display_name(&self.db, &self.references, genus, species, exclude_observation_id)
    }

    // ========================================================================
    // Export and import
    // ========================================================================

    fn bundle_roots(&self) -> BundleRoots {
        BundleRoots::new(
            self.catalog.images_root(),
            self.paths.calibrations_dir(),
            self.catalog.thumbnails_root(),
        )
    }

    pub fn export_bundle(
        &self,
        zip_path: &Path,
        flags: IncludeFlags,
        reporter: &mut Reporter<'_>,
    ) -> Result<ExportSummary> {
        crate::bundle::export_bundle(
            &self.db,
            Some(&self.references),
            &self.bundle_roots(),
            zip_path,
            flags,
            reporter,
        )
    }

    pub fn import_bundle(
        &mut self,
        zip_path: &Path,
        flags: IncludeFlags,
        reporter: &mut Reporter<'_>,
    ) -> Result<ImportSummary> {
        let roots = self.bundle_roots();
        let result = crate::bundle::import_bundle(
            &mut self.db,
            Some(&mut self.references),
            &roots,
            zip_path,
            flags,
            reporter,
        );
        // earlier entity batches may have committed even on failure
        self.active.reload(&self.db)?;
        self.availability.invalidate();
        result
    }

    /// Write a COCO or YOLO training set for the given images.
    pub fn export_ml(
        &self,
        image_ids: &[i64],
        out_dir: &Path,
        writer: &dyn DatasetWriter,
        options: &MlExportOptions,
    ) -> Result<ExportStats> {
        crate::ml_export::export_dataset(&self.db, image_ids, out_dir, writer, options)
    }
}

impl std::fmt::Debug for Workbench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workbench")
            .field("data_dir", &self.paths.data_dir)
            .field("db", &self.db)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::LengthUnit;
    use crate::model::{ImageType, ObservationDraft};
    use tempfile::TempDir;

    fn spore(x: f64) -> MeasurementShape {
        MeasurementShape::Rect {
            p1: Point::new(x, 100.0),
            p2: Point::new(x + 100.0, 100.0),
            p3: Point::new(x + 50.0, 80.0),
            p4: Point::new(x + 50.0, 120.0),
        }
    }

    fn setup() -> (TempDir, Workbench, i64, i64) {
        let dir = TempDir::new().unwrap();
        let mut bench = Workbench::open(AppPaths::new(dir.path().join("data"))).unwrap();
        let src = dir.path().join("slide.png");
        image::GrayImage::from_pixel(400, 300, image::Luma([200]))
            .save(&src)
            .unwrap();
        let obs = bench
            .create_observation(&ObservationDraft::new("2024-09-01").with_taxon("Amanita", "muscaria"))
            .unwrap();
        let image = bench
            .add_image(obs, &NewImage::microscope(&src).with_scale(0.1))
            .unwrap();
        (dir, bench, obs, image)
    }

    #[test]
    fn test_open_seeds_layout() {
        let dir = TempDir::new().unwrap();
        let bench = Workbench::open(AppPaths::new(dir.path())).unwrap();
        assert!(dir.path().join(AppPaths::OBJECTIVES_FILE).is_file());
        assert!(dir.path().join(AppPaths::DATABASE_FILE).is_file());
        assert!(bench.paths().images_dir().is_dir());
        assert!(!bench.objectives().is_empty());
    }

    #[test]
    fn test_measurement_refreshes_statistics_and_availability() {
        let (_dir, mut bench, obs, image) = setup();
        let (_, has_data) = bench.species_display_name("Amanita", "muscaria", None).unwrap();
        assert!(!has_data);

        bench.add_measurement(image, spore(100.0), None).unwrap();
        bench.add_measurement(image, spore(150.0), Some("spores")).unwrap();

        let cached = bench.database().require_observation(obs).unwrap().spore_statistics;
        assert!(cached.unwrap().ends_with("n = 2"));
        let (name, has_data) = bench.species_display_name("Amanita", "muscaria", None).unwrap();
        assert!(has_data);
        assert!(name.starts_with("Amanita muscaria "));

        let info = bench.species_info("Amanita", "muscaria", Some(obs)).unwrap();
        assert!(!info.has_points());
    }

    #[test]
    fn test_measurement_needs_scale() {
        let (dir, mut bench, obs, _) = setup();
        let src = dir.path().join("field.png");
        image::GrayImage::from_pixel(50, 50, image::Luma([10]))
            .save(&src)
            .unwrap();
        let field = bench
            .add_image(obs, &NewImage::new(&src, ImageType::Field))
            .unwrap();
        let err = bench.add_measurement(field, spore(0.0), None).unwrap_err();
        assert!(matches!(err, Error::ScaleUnresolved { image_id } if image_id == field));
        assert_eq!(bench.scale_status(field).unwrap(), ScaleStatus::FieldNoScale);
    }

    #[test]
    fn test_update_and_delete_measurement() {
        let (_dir, mut bench, obs, image) = setup();
        let id = bench.add_measurement(image, spore(100.0), None).unwrap();
        let wider = MeasurementShape::Rect {
            p1: Point::new(100.0, 100.0),
            p2: Point::new(200.0, 100.0),
            p3: Point::new(150.0, 70.0),
            p4: Point::new(150.0, 130.0),
        };
        bench.update_measurement(id, wider).unwrap();
        let m = bench.database().get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 10.0).abs() < 1e-9);
        assert!((m.width_um.unwrap() - 6.0).abs() < 1e-9);

        assert_eq!(
            bench.measurement_at(image, Point::new(150.0, 101.0), 8.0).unwrap(),
            Some(id)
        );
        bench.delete_measurement(id).unwrap();
        let cached = bench.database().require_observation(obs).unwrap().spore_statistics;
        assert_eq!(cached, None);
    }

    #[test]
    fn test_calibration_activation_syncs_catalog() {
        let (_dir, mut bench, _, _) = setup();
        let key = bench.objectives().keys().next().unwrap().to_string();
        let first = bench.add_calibration(&NewCalibration::new(key.as_str(), 0.2)).unwrap();
        assert_eq!(bench.active_calibrations().get(&key).unwrap().id, first);
        assert!((bench.objectives().get(&key).unwrap().microns_per_pixel - 0.2).abs() < 1e-12);

        let second = bench
            .add_calibration(&NewCalibration::new(key.as_str(), 0.25).inactive())
            .unwrap();
        assert_eq!(bench.active_calibrations().get(&key).unwrap().id, first);
        bench.activate_calibration(second).unwrap();
        assert_eq!(bench.active_calibrations().get(&key).unwrap().id, second);

        let reopened = ObjectiveCatalog::load_or_seed(&bench.paths().objectives()).unwrap();
        assert!((reopened.get(&key).unwrap().microns_per_pixel - 0.25).abs() < 1e-12);

        bench.delete_calibration(second).unwrap();
        assert!(bench.active_calibrations().get(&key).is_none());
        assert!(bench.add_calibration(&NewCalibration::new("Custom", 0.1)).is_err());
    }

    #[test]
    fn test_new_image_binds_active_calibration() {
        let (dir, mut bench, obs, _) = setup();
        let key = bench.objectives().keys().next().unwrap().to_string();
        let cal = bench.add_calibration(&NewCalibration::new(key.as_str(), 0.2)).unwrap();
        let src = dir.path().join("slide.png");
        let image = bench
            .add_image(obs, &NewImage::microscope(&src).with_objective(key.as_str()))
            .unwrap();
        let record = bench.database().require_image(image).unwrap();
        assert_eq!(record.calibration_id, Some(cal));
        let resolution = bench.resolve_scale(image).unwrap().unwrap();
        assert!((resolution.microns_per_pixel - 0.2).abs() < 1e-12);

        // a deleted calibration falls back to the catalog value
        bench.delete_calibration(cal).unwrap();
        let resolution = bench.resolve_scale(image).unwrap().unwrap();
        assert!(matches!(resolution.source, crate::scale::ScaleSource::Objective { .. }));

        assert!(bench
            .add_image(obs, &NewImage::microscope(&src).with_objective("999X"))
            .is_err());
    }

    #[test]
    fn test_custom_scale_rescale() {
        let (_dir, mut bench, _, image) = setup();
        let id = bench.add_measurement(image, spore(100.0), None).unwrap();
        let bar = ScaleBar::new(
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            20.0,
            LengthUnit::Micrometers,
        );
        let (mpp, plan) = bench.set_custom_scale(image, &bar).unwrap();
        assert!((mpp - 0.2).abs() < 1e-12);
        bench.apply_rescale(image, &plan.unwrap()).unwrap();
        let m = bench.database().get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 20.0).abs() < 1e-9);
        assert_eq!(bench.scale_status(image).unwrap(), ScaleStatus::Custom);
    }

    #[test]
    fn test_custom_scale_on_objective_image() {
        let (dir, mut bench, obs, _) = setup();
        let key = bench.objectives().keys().next().unwrap().to_string();
        let nominal = bench.objectives().get(&key).unwrap().microns_per_pixel;
        let image = bench
            .add_image(obs, &NewImage::microscope(dir.path().join("slide.png")).with_objective(key.as_str()))
            .unwrap();
        assert_eq!(bench.database().require_image(image).unwrap().scale_microns_per_pixel, None);
        let id = bench.add_measurement(image, spore(100.0), None).unwrap();
        let before = bench.database().get_measurement(id).unwrap().unwrap().length_um;
        assert!((before - 100.0 * nominal).abs() < 1e-9);

        let bar = ScaleBar::new(
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            20.0,
            LengthUnit::Micrometers,
        );
        let (_, plan) = bench.set_custom_scale(image, &bar).unwrap();
        let plan = plan.expect("effective scale changed");
        assert!((plan.old_scale - nominal).abs() < 1e-12);
        bench.apply_rescale(image, &plan).unwrap();
        let m = bench.database().get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 20.0).abs() < 1e-9);
        assert!((m.width_um.unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_activation_rescales_catalog_images() {
        let (dir, mut bench, obs, image) = setup();
        let key = bench.objectives().keys().next().unwrap().to_string();
        let nominal = bench.objectives().get(&key).unwrap().microns_per_pixel;
        let on_objective = bench
            .add_image(obs, &NewImage::microscope(dir.path().join("slide.png")).with_objective(key.as_str()))
            .unwrap();
        let scaled = bench.add_measurement(on_objective, spore(100.0), None).unwrap();
        let untouched = bench.add_measurement(image, spore(100.0), None).unwrap();

        let cal = bench
            .add_calibration(&NewCalibration::new(key.as_str(), nominal * 2.0).inactive())
            .unwrap();
        let (_, rescaled) = bench.activate_calibration(cal).unwrap();
        let summary = rescaled.unwrap();
        assert_eq!(summary.measurements, 1);
        assert!((summary.ratio - 2.0).abs() < 1e-12);

        let m = bench.database().get_measurement(scaled).unwrap().unwrap();
        let resolved = bench.resolve_scale(on_objective).unwrap().unwrap();
        assert!((resolved.microns_per_pixel - nominal * 2.0).abs() < 1e-12);
        assert!((m.length_um - 100.0 * resolved.microns_per_pixel).abs() < 1e-9);
        let m = bench.database().get_measurement(untouched).unwrap().unwrap();
        assert!((m.length_um - 10.0).abs() < 1e-9);

        // same value again leaves the catalog alone
        let again = bench
            .add_calibration(&NewCalibration::new(key.as_str(), nominal * 2.0).inactive())
            .unwrap();
        assert_eq!(bench.activate_calibration(again).unwrap().1, None);
    }

    #[test]
    fn test_calibration_scale_edit_rescales_bound_images() {
        let (dir, mut bench, obs, _) = setup();
        let key = bench.objectives().keys().next().unwrap().to_string();
        let cal = bench.add_calibration(&NewCalibration::new(key.as_str(), 0.2)).unwrap();
        let image = bench
            .add_image(obs, &NewImage::microscope(dir.path().join("slide.png")).with_objective(key.as_str()))
            .unwrap();
        let id = bench.add_measurement(image, spore(100.0), None).unwrap();

        let summary = bench.update_calibration_scale(cal, 0.25).unwrap();
        assert_eq!(summary.measurements, 1);
        let m = bench.database().get_measurement(id).unwrap().unwrap();
        assert!((m.length_um - 25.0).abs() < 1e-9);
        assert!((m.width_um.unwrap() - 10.0).abs() < 1e-9);
        assert!((bench.objectives().get(&key).unwrap().microns_per_pixel - 0.25).abs() < 1e-12);
        let resolved = bench.resolve_scale(image).unwrap().unwrap();
        assert!((resolved.microns_per_pixel - 0.25).abs() < 1e-12);
        let cached = bench.database().require_observation(obs).unwrap().spore_statistics;
        assert!(cached.unwrap().contains("25.0"));

        assert!(bench.update_calibration_scale(cal, 0.0).is_err());
        assert!(bench.update_calibration_scale(9999, 0.3).is_err());
    }

    #[test]
    fn test_storage_mode_is_persisted() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::new(dir.path());
        let mut bench = Workbench::open(paths.clone()).unwrap();
        bench
            .set_original_storage_mode(OriginalStorageMode::Global)
            .unwrap();
        drop(bench);
        let bench = Workbench::open(paths).unwrap();
        assert_eq!(bench.catalog().storage_mode(), OriginalStorageMode::Global);
    }

    #[test]
    fn test_bundle_round_trip_between_workbenches() {
        let (dir, mut source, _, image) = setup();
        source.add_measurement(image, spore(100.0), None).unwrap();
        let zip = dir.path().join("bundle.zip");
        source
            .export_bundle(&zip, IncludeFlags::all(), &mut Reporter::silent())
            .unwrap();

        let dest_dir = TempDir::new().unwrap();
        let mut dest = Workbench::open(AppPaths::new(dest_dir.path())).unwrap();
        let summary = dest
            .import_bundle(&zip, IncludeFlags::all(), &mut Reporter::silent())
            .unwrap();
        assert_eq!(summary.observations, 1);
        assert_eq!(summary.measurements, 1);
        let (_, has_data) = dest.species_display_name("Amanita", "muscaria", None).unwrap();
        assert!(has_data);
    }
}
