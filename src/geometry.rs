//! Core geometry for raster sampling.
//!
//! Rasters are addressed in two coordinate systems: *map* coordinates
//! (in the raster CRS) and *pixel* coordinates `(col, row)`. The
//! affine geo-transform between the two is represented as a
//! homogeneous [`PixelTransform`]; rectangular regions of pixels as
//! [`RasterWindow`].

use anyhow::{anyhow, Result};
use geo::Rect;
use nalgebra::{Matrix3, Point2};
use serde_derive::Serialize;

/// Dimensions of a raster or window: `(cols, rows)`.
pub type RasterDims = (usize, usize);

/// Offset into a raster: `(col, row)`. Negative offsets describe
/// windows that hang off the raster edge.
pub type RasterOffset = (isize, isize);

/// A rectangular window of pixels: offset and dimensions.
pub type RasterWindow = (RasterOffset, RasterDims);

/// Affine transform between coordinate systems, in homogeneous
/// coordinates.
pub type PixelTransform = Matrix3<f64>;

/// A point with an optional vertical component. `z` is 0 for purely
/// planimetric queries.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Point3 { x, y, z }
    }

    pub fn xy(x: f64, y: f64) -> Self {
        Point3 { x, y, z: 0. }
    }
}

/// Build the pixel to map transform from GDAL-style geo-transform
/// coefficients.
pub fn transform_from_raw(gt: &[f64; 6]) -> PixelTransform {
    PixelTransform::new(gt[1], gt[2], gt[0], gt[4], gt[5], gt[3], 0., 0., 1.)
}

/// Invert a transform; fails on rasters with a degenerate
/// geo-transform.
pub fn invert_transform(t: &PixelTransform) -> Result<PixelTransform> {
    t.try_inverse()
        .ok_or_else(|| anyhow!("couldn't invert pixel transform"))
}

/// Map coordinates of the center of pixel `(col, row)`.
pub fn pixel_to_map(t: &PixelTransform, col: usize, row: usize) -> (f64, f64) {
    let pt = t.transform_point(&Point2::new(col as f64 + 0.5, row as f64 + 0.5));
    (pt.x, pt.y)
}

/// Pixel containing map coordinates `(x, y)`. `inv` is the map to
/// pixel transform obtained from [`invert_transform`].
pub fn map_to_pixel(inv: &PixelTransform, x: f64, y: f64) -> RasterOffset {
    let pt = inv.transform_point(&Point2::new(x, y));
    (pt.x.floor() as isize, pt.y.floor() as isize)
}

/// True when a square window of `window` pixels starting at `(x, y)`
/// fits strictly inside a raster of dimension `dims`.
pub fn window_within((x, y): RasterOffset, window: usize, dims: RasterDims) -> bool {
    if x < 0 || y < 0 {
        return false;
    }
    let (cols, rows) = (dims.0 as isize, dims.1 as isize);
    x + (window as isize) < cols && y + (window as isize) < rows
}

/// Meters per degree of longitude at latitude `lat` (degrees).
pub fn meters_per_lon_degree(lat: f64) -> f64 {
    111_320. * lat.to_radians().cos()
}

/// Number of pixels covering `radius` meters on a raster with pixel
/// width `dx` (CRS units). Grids with sub-decimeter pixel widths are
/// taken to be in degrees and converted at latitude `lat`.
pub fn radius_in_pixels(radius: f64, dx: f64, lat: f64) -> usize {
    if radius <= 0. {
        return 0;
    }
    let mut dx = dx.abs();
    if dx < 0.1 {
        dx *= meters_per_lon_degree(lat);
    }
    (radius / dx).ceil() as usize
}

/// Extensions to [`Rect`] for containment tests and window clipping.
pub trait BoundsExt {
    /// Inclusive containment of map coordinates.
    fn contains_xy(&self, x: f64, y: f64) -> bool;

    /// The bounds grown by `margin` on every side.
    fn expanded(&self, margin: f64) -> Self;

    /// Truncate a rectangle in pixel coordinates to a valid window of
    /// a raster of dimension `dims`. The window may be empty.
    fn window_from_bounds(&self, dims: RasterDims) -> RasterWindow;
}

impl BoundsExt for Rect<f64> {
    fn contains_xy(&self, x: f64, y: f64) -> bool {
        x >= self.min().x && x <= self.max().x && y >= self.min().y && y <= self.max().y
    }

    fn expanded(&self, margin: f64) -> Self {
        Rect::new(
            (self.min().x - margin, self.min().y - margin),
            (self.max().x + margin, self.max().y + margin),
        )
    }

    fn window_from_bounds(&self, dims: RasterDims) -> RasterWindow {
        let (cols, rows) = (dims.0 as isize, dims.1 as isize);
        let left = (self.min().x.floor() as isize).max(0);
        let top = (self.min().y.floor() as isize).max(0);
        let right = (self.max().x.ceil() as isize).min(cols);
        let bottom = (self.max().y.ceil() as isize).min(rows);
        let width = (right - left).max(0) as usize;
        let height = (bottom - top).max(0) as usize;
        ((left, top), (width, height))
    }
}
