pub use crate::{Error, Result};

pub use crate::catalog::*;
pub use crate::config::*;
pub use crate::engine::*;
pub use crate::geometry::*;
pub use crate::groups::*;
pub use crate::index::*;
pub use crate::raster::*;
pub use crate::sample::*;
pub use crate::time::*;

#[cfg(feature = "gdal")]
pub use crate::gdal::*;
