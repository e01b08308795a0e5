//! Utilities to sample large collections of geo-referenced rasters.
//!
//! A collection is described by a vector *index file* (typically
//! GeoJSON): one feature per scene, carrying the paths of the scene
//! rasters and the scene acquisition time. The [`engine`] module
//! drives the full pipeline: query the index for the scenes covering a
//! point, group and filter them, then read pixel values (optionally
//! resampled, with zonal statistics) through a bounded pool of reader
//! threads. Batched queries share the work of index lookup and raster
//! reads across many points.
//!
//! Backends are pluggable. The [`catalog`] module defines the trait a
//! dataset implements to describe its index layout; the [`raster`] and
//! [`index`] modules define the traits a raster I/O backend
//! implements. GDAL-backed implementations of all three are provided
//! behind the `gdal` feature (enabled by default).

pub use anyhow::Error;
/// The [`Result`](std::result::Result) type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub mod batch;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dictionary;
pub mod engine;
pub mod filter;
pub mod geometry;
pub mod groups;
pub mod index;
pub mod raster;
pub mod readers;
pub mod sample;
pub mod time;

#[cfg(feature = "gdal")]
pub mod gdal;

pub mod prelude;

#[cfg(test)]
pub(crate) mod mock;
