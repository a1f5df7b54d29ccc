//! Request geometry: points, rectangular extents, and their polygon form.
//!
//! All request geometry is expressed in a geographic CRS (longitude before
//! latitude). A rectangular area of interest is promoted to a closed
//! four-vertex polygon before it is tested against index features.

use geo::{polygon, Geometry, Point};

/// A 3D point: longitude, latitude, height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A rectangular extent: `[min_x, min_y, max_x, max_y]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// An empty extent, the identity for [`Extent::union`].
    pub fn empty() -> Self {
        Self {
            min_x: f64::MAX,
            min_y: f64::MAX,
            max_x: f64::MIN,
            max_y: f64::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    /// Inclusive containment test. Points exactly on an edge are inside.
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Intersection of two extents, or `None` when they do not overlap.
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let min_x = self.min_x.max(other.min_x);
        let min_y = self.min_y.max(other.min_y);
        let max_x = self.max_x.min(other.max_x);
        let max_y = self.max_y.min(other.max_y);

        if min_x < max_x && min_y < max_y {
            Some(Extent {
                min_x,
                min_y,
                max_x,
                max_y,
            })
        } else {
            None
        }
    }

    /// Promote the extent to a closed four-vertex polygon.
    pub fn to_polygon(&self) -> geo::Polygon<f64> {
        polygon![
            (x: self.min_x, y: self.min_y),
            (x: self.max_x, y: self.min_y),
            (x: self.max_x, y: self.max_y),
            (x: self.min_x, y: self.max_y),
            (x: self.min_x, y: self.min_y),
        ]
    }
}

/// The geometry of a sampling request.
#[derive(Debug, Clone)]
pub enum QueryGeometry {
    Point(Point3),
    Extent(Extent),
}

impl QueryGeometry {
    pub fn is_extent(&self) -> bool {
        matches!(self, QueryGeometry::Extent(_))
    }

    /// Convert to a `geo` geometry for feature intersection tests.
    pub fn to_geo(&self) -> Geometry<f64> {
        match self {
            QueryGeometry::Point(p) => Geometry::Point(Point::new(p.x, p.y)),
            QueryGeometry::Extent(e) => Geometry::Polygon(e.to_polygon()),
        }
    }
}

/// A caller-supplied point with its stable index and optional GPS time.
///
/// `gps` is seconds since the GPS epoch; zero means the point carries no
/// timestamp.
#[derive(Debug, Clone, Copy)]
pub struct PointInfo {
    pub point: Point3,
    pub index: usize,
    pub gps: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Intersects;

    #[test]
    fn test_extent_contains_edge() {
        let e = Extent::new(-10.0, -10.0, 10.0, 10.0);
        assert!(e.contains_point(10.0, 10.0));
        assert!(e.contains_point(-10.0, 0.0));
        assert!(!e.contains_point(10.000000000001, 0.0));
    }

    #[test]
    fn test_extent_union() {
        let a = Extent::new(0.0, 0.0, 1.0, 1.0);
        let b = Extent::new(-1.0, 0.5, 0.5, 2.0);
        let u = a.union(&b);
        assert_eq!(u, Extent::new(-1.0, 0.0, 1.0, 2.0));

        let e = Extent::empty();
        assert_eq!(e.union(&a), a);
    }

    #[test]
    fn test_extent_intersect() {
        let a = Extent::new(0.0, 0.0, 10.0, 10.0);
        let b = Extent::new(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.intersect(&b), Some(Extent::new(5.0, 5.0, 10.0, 10.0)));

        let c = Extent::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn test_extent_to_polygon_closed() {
        let e = Extent::new(0.0, 0.0, 2.0, 1.0);
        let poly = e.to_polygon();
        let ring = poly.exterior();
        assert_eq!(ring.0.len(), 5);
        assert_eq!(ring.0.first(), ring.0.last());
    }

    #[test]
    fn test_query_geometry_intersects() {
        let aoi = QueryGeometry::Extent(Extent::new(0.0, 0.0, 1.0, 1.0));
        let inside = Geometry::Point(Point::new(0.5, 0.5));
        let outside = Geometry::Point(Point::new(2.0, 2.0));
        assert!(aoi.to_geo().intersects(&inside));
        assert!(!aoi.to_geo().intersects(&outside));
    }
}
