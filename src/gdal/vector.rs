//! Vector index files through OGR.
//!
//! An index file is any OGR-readable vector dataset with one feature
//! per scene. The spatial pre-filter is pushed down as an OGR layer
//! filter over the hull's buffered bounding box, then re-checked
//! against the hull itself once the features are in memory.

use anyhow::{Context, Result};
use gdal::vector::{Geometry, LayerAccess};
use gdal::Dataset;
use geo::{BoundingRect, Rect};
use log::warn;
use std::collections::HashMap;
use std::path::Path;

use crate::geometry::BoundsExt;
use crate::index::{FieldValue, IndexData, IndexFeature, IndexSource, SpatialFilter};

/// Reads index features from the first layer of an OGR dataset.
pub struct GdalIndexSource;

impl IndexSource for GdalIndexSource {
    fn read(&self, path: &str, filter: Option<&SpatialFilter>) -> Result<IndexData> {
        let dataset = Dataset::open(Path::new(path))
            .with_context(|| format!("opening index {:?}", path))?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("index {:?} has no layer", path))?;

        if let Some(filter) = filter {
            if let Some(bounds) = filter.hull().bounding_rect() {
                let bounds = bounds.expanded(filter.tolerance());
                let bbox = Geometry::bbox(
                    bounds.min().x,
                    bounds.min().y,
                    bounds.max().x,
                    bounds.max().y,
                )?;
                layer.set_spatial_filter(&bbox);
            }
        }

        let mut features = Vec::new();
        for (i, feature) in layer.features().enumerate() {
            let geometry = match feature.geometry() {
                Some(g) => g,
                None => continue,
            };
            let geometry = match geometry.to_geo() {
                Ok(g) => g,
                Err(err) => {
                    warn!("skipping feature {} of {:?}: {}", i, path, err);
                    continue;
                }
            };
            let mut fields = HashMap::new();
            for (name, value) in feature.fields() {
                if let Some(value) = value.and_then(convert_field) {
                    fields.insert(name, value);
                }
            }
            let fid = feature.fid().unwrap_or(i as u64);
            if let Some(feature) = IndexFeature::new(fid, geometry, fields) {
                features.push(feature);
            }
        }
        if let Some(filter) = filter {
            features.retain(|f| filter.accepts(f.envelope()));
        }

        let bbox = layer
            .try_get_extent()?
            .map(|e| Rect::new((e.MinX, e.MinY), (e.MaxX, e.MaxY)));
        Ok(IndexData {
            features,
            bbox,
            dims: dataset.raster_size(),
        })
    }
}

fn convert_field(value: gdal::vector::FieldValue) -> Option<FieldValue> {
    use gdal::vector::FieldValue as Ogr;
    match value {
        Ogr::StringValue(s) => Some(FieldValue::String(s)),
        Ogr::StringListValue(v) => Some(FieldValue::StringList(v)),
        Ogr::IntegerValue(v) => Some(FieldValue::Integer(v as i64)),
        Ogr::Integer64Value(v) => Some(FieldValue::Integer(v)),
        Ogr::RealValue(v) => Some(FieldValue::Real(v)),
        Ogr::DateTimeValue(v) => Some(FieldValue::String(v.to_rfc3339())),
        Ogr::DateValue(v) => Some(FieldValue::String(v.to_string())),
        _ => None,
    }
}
