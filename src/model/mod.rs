//! Data models for observations, images, measurements and calibrations.

mod annotation;
mod calibration;
mod image;
mod measurement;
mod observation;
mod reference;

pub use annotation::{
    BoundingBox, DEFAULT_BBOX_PADDING, SOURCE_AUTO, SOURCE_MANUAL, SporeAnnotation,
};
pub use calibration::{Calibration, CalibrationMeasurement, CalibrationStats, NewCalibration};
pub use image::{CUSTOM_OBJECTIVE, CropBox, ImageRecord, ImageType, NewImage};
pub use measurement::{
    GalleryRotation, Measurement, NewMeasurement, SPORE_CATEGORY, canonical_measurement_type,
    is_spore_type,
};
pub use observation::{Observation, ObservationDraft, SourceType, generated_species_guess};
pub use reference::ReferenceValues;
