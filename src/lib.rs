//! MycoLog - spore morphometry for microscope photographs.
//!
//! Observations own images; images carry a spatial scale (µm per pixel)
//! resolved from an objective calibration; spores are measured on the
//! images and summarized per observation and per species. The
//! [`Workbench`] ties the stores and caches together and is the entry point
//! for applications.

pub mod automeasure;
pub mod availability;
pub mod bundle;
pub mod calibration;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod geometry;
pub mod ml_export;
pub mod model;
pub mod reference;
pub mod rescale;
pub mod scale;
pub mod stats;
pub mod workbench;

pub use error::{Error, Result};
pub use workbench::Workbench;
