//! Index-file resolution.
//!
//! Which vector index file covers a request is dataset-specific: strip DEM
//! products shard their indexes by 1°×1° geocell, mosaic products keep a
//! single index. The sampler takes the policy as an injected trait object.

use crate::geometry::QueryGeometry;
use std::path::{Path, PathBuf};

/// Resolves the vector index file covering a request geometry.
pub trait IndexResolver: Send + Sync {
    fn index_file(&self, geometry: &QueryGeometry) -> PathBuf;
}

/// A dataset served by a single index file.
#[derive(Debug, Clone)]
pub struct FixedResolver {
    path: PathBuf,
}

impl FixedResolver {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl IndexResolver for FixedResolver {
    fn index_file(&self, _geometry: &QueryGeometry) -> PathBuf {
        self.path.clone()
    }
}

/// Geocell-sharded indexes, named for the southwest corner of the 1°×1°
/// cell: `n61w121.geojson`, `s54e005.geojson`.
///
/// Strip DEM files are distributed in folders according to the geocell in
/// which the strip centroid resides; latitude is zero-padded to two digits,
/// longitude to three. For an extent the cell of the extent's center is
/// used.
#[derive(Debug, Clone)]
pub struct GeocellResolver {
    base: PathBuf,
}

impl GeocellResolver {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn cell_name(lon: f64, lat: f64) -> String {
        let ilon = lon.floor() as i32;
        let ilat = lat.floor() as i32;

        let ns = if ilat < 0 { 's' } else { 'n' };
        let ew = if ilon < 0 { 'w' } else { 'e' };

        format!("{}{:02}{}{:03}.geojson", ns, ilat.abs(), ew, ilon.abs())
    }
}

impl IndexResolver for GeocellResolver {
    fn index_file(&self, geometry: &QueryGeometry) -> PathBuf {
        let (lon, lat) = match geometry {
            QueryGeometry::Point(p) => (p.x, p.y),
            QueryGeometry::Extent(e) => ((e.min_x + e.max_x) / 2.0, (e.min_y + e.max_y) / 2.0),
        };
        self.base.join(Self::cell_name(lon, lat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Extent, Point3};

    #[test]
    fn test_geocell_names() {
        assert_eq!(GeocellResolver::cell_name(-120.3, 61.0), "n61w121.geojson");
        assert_eq!(GeocellResolver::cell_name(-50.8, 61.2), "n61w051.geojson");
        assert_eq!(GeocellResolver::cell_name(-5.0, 61.0), "n61w005.geojson");
        assert_eq!(GeocellResolver::cell_name(5.0, 61.0), "n61e005.geojson");
    }

    #[test]
    fn test_geocell_southern_hemisphere() {
        // floor(-54.2) = -55; the cell is keyed by its southwest corner
        assert_eq!(GeocellResolver::cell_name(156.4, -54.2), "s55e156.geojson");
        assert_eq!(GeocellResolver::cell_name(-70.1, -33.5), "s34w071.geojson");
    }

    #[test]
    fn test_geocell_resolver_point() {
        let resolver = GeocellResolver::new("/data/strips");
        let geom = QueryGeometry::Point(Point3::new(156.7, 51.2, 0.0));
        assert_eq!(
            resolver.index_file(&geom),
            PathBuf::from("/data/strips/n51e156.geojson")
        );
    }

    #[test]
    fn test_geocell_resolver_extent_uses_center() {
        let resolver = GeocellResolver::new("/data/strips");
        let geom = QueryGeometry::Extent(Extent::new(10.0, 60.0, 11.0, 61.0));
        assert_eq!(
            resolver.index_file(&geom),
            PathBuf::from("/data/strips/n60e010.geojson")
        );
    }

    #[test]
    fn test_fixed_resolver() {
        let resolver = FixedResolver::new("/data/mosaic.geojson");
        let geom = QueryGeometry::Point(Point3::new(0.0, 0.0, 0.0));
        assert_eq!(
            resolver.index_file(&geom),
            PathBuf::from("/data/mosaic.geojson")
        );
    }
}
