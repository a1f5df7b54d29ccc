//! Coordinate Reference System utilities.
//!
//! Request geometry arrives in a geographic CRS (longitude, latitude) and is
//! transformed into each raster's native CRS before pixel math. Transforms
//! are built through PROJ with axis order normalized to longitude-before-
//! latitude, so `EPSG:4326` behaves as (lon, lat) everywhere.

use crate::geometry::Extent;
use anyhow::{Context, Result};
use proj::Proj;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Common CRS codes used throughout the engine.
pub mod codes {
    /// WGS84 geographic coordinate system (lon/lat in degrees). The default
    /// CRS for request points and vector index features.
    pub const WGS84: &str = "EPSG:4326";
}

/// EPSG code string of a UTM zone (326xx north, 327xx south).
pub fn utm_epsg(zone: u8, north: bool) -> String {
    if north {
        format!("EPSG:{}", 32600 + zone as u32)
    } else {
        format!("EPSG:{}", 32700 + zone as u32)
    }
}

/// Shared cache of transformations out of the request CRS.
///
/// The request CRS is fixed for the life of a sampler, while raster CRSes
/// repeat heavily: a strip DEM catalog puts hundreds of rasters in the same
/// projected CRS. Handles look their transform up here at open, so the
/// PROJ object is built once per distinct raster CRS rather than once per
/// handle. Reader and batch reader threads share the cache through an
/// `Arc`.
pub struct TransformCache {
    input_crs: String,
    cache: RwLock<HashMap<String, Arc<Proj>>>,
}

impl TransformCache {
    pub fn new(input_crs: &str) -> Self {
        Self {
            input_crs: input_crs.to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The fixed source CRS of every cached transform.
    pub fn input_crs(&self) -> &str {
        &self.input_crs
    }

    /// Get or build the transform from the request CRS into `raster_crs`.
    ///
    /// `raster_crs` may be an EPSG code or the WKT a dataset reports for
    /// itself; it is used verbatim as the cache key.
    pub fn get(&self, raster_crs: &str) -> Result<Arc<Proj>> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(proj) = cache.get(raster_crs) {
                return Ok(proj.clone());
            }
        }

        let proj = Arc::new(make_transform(&self.input_crs, raster_crs)?);

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache
            .entry(raster_crs.to_string())
            .or_insert(proj)
            .clone())
    }
}

/// Build a single transformation between two CRS.
///
/// `from` and `to` may be EPSG codes, PROJ strings, or WKT (a raster's
/// reported projection is passed through unchanged).
pub fn make_transform(from_crs: &str, to_crs: &str) -> Result<Proj> {
    Proj::new_known_crs(from_crs, to_crs, None)
        .with_context(|| format!("Failed to create projection from {} to {}", from_crs, to_crs))
}

/// Transform an extent through an already-built projection.
///
/// Transforms all 4 corners and returns the bounding box of the result,
/// which handles projection distortion for the rectangle sizes this engine
/// works with.
pub fn transform_extent_with(extent: &Extent, proj: &Proj) -> Result<Extent> {
    let corners = [
        (extent.min_x, extent.min_y),
        (extent.max_x, extent.min_y),
        (extent.max_x, extent.max_y),
        (extent.min_x, extent.max_y),
    ];

    let mut out = Extent::empty();
    for (x, y) in corners {
        let (tx, ty) = proj
            .convert((x, y))
            .with_context(|| format!("Failed to transform corner ({}, {})", x, y))?;
        out = out.union(&Extent::new(tx, ty, tx, ty));
    }

    Ok(out)
}
