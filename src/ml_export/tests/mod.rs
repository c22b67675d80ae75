//! Tests for annotation derivation and the dataset writers.

mod yolo_tests;

use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::geometry::{MeasurementShape, Point};
use crate::model::{ImageRecord, ImageType, NewMeasurement};

/// A spore whose length axis runs along x from (100,100) to (200,100).
pub(super) fn spore_shape() -> MeasurementShape {
    MeasurementShape::Rect {
        p1: Point::new(100.0, 100.0),
        p2: Point::new(200.0, 100.0),
        p3: Point::new(150.0, 80.0),
        p4: Point::new(150.0, 120.0),
    }
}

/// Write a blank 400x300 PNG.
pub(super) fn write_png(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    image::GrayImage::from_pixel(400, 300, image::Luma([200]))
        .save(&path)
        .unwrap();
    path
}

/// Store an image row for `path` with one four-point spore and one line.
pub(super) fn image_with_spore(db: &Database, path: &Path) -> i64 {
    let image = db
        .insert_image(&ImageRecord {
            scale_microns_per_pixel: Some(0.1),
            ..ImageRecord::new(path, ImageType::Microscope)
        })
        .unwrap();
    db.add_measurement(image, &NewMeasurement::from_shape(spore_shape(), 0.1).unwrap())
        .unwrap();
    db.add_measurement(image, &NewMeasurement::new(5.0, None)).unwrap();
    image
}
