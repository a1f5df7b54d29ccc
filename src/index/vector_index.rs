//! Vector index: which rasters cover which geometry.
//!
//! An index file is a geojson layer whose features pair a footprint
//! geometry with the covered raster's file path and acquisition time.
//! Features are cloned into plain owned structs at load and the file is
//! closed before `open` returns; everything downstream (finder partitions,
//! intersection tests) works on the in-process copy.

use crate::config::FilterConfig;
use crate::geometry::{Extent, QueryGeometry};
use crate::index::resolver::IndexResolver;
use crate::time;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use geo::BoundingRect;
use geojson::{FeatureCollection, GeoJson};
use std::path::PathBuf;
use std::sync::Arc;

/// Property carrying the value raster's file path.
pub const VALUE_FIELD: &str = "Value";

/// Optional property carrying an explicit flags raster path.
pub const FLAGS_FIELD: &str = "Fmask";

/// Property names carrying the feature date.
const DATE_FIELD: &str = "datetime";
const START_DATE_FIELD: &str = "start_datetime";
const END_DATE_FIELD: &str = "end_datetime";

/// One feature cloned out of the index layer.
#[derive(Debug, Clone)]
pub struct IndexFeature {
    /// Footprint of the raster
    pub geometry: geo::Geometry<f64>,

    /// Envelope of the footprint
    pub envelope: Extent,

    /// Path of the value raster
    pub raster_path: String,

    /// Explicit flags raster path, when the index carries one
    pub flags_path: Option<String>,

    /// Feature date; the mean of `start_datetime`/`end_datetime` when the
    /// index carries a pair
    pub date: DateTime<Utc>,

    /// Feature time in GPS seconds
    pub gps_time: i64,

    /// Whether the feature carried a parseable date at all
    pub has_date: bool,
}

/// A read-only collection of index features with their union bounding box.
pub struct VectorIndex {
    path: Option<PathBuf>,
    features: Arc<Vec<IndexFeature>>,
    bbox: Extent,
    rows: usize,
    cols: usize,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            path: None,
            features: Arc::new(Vec::new()),
            bbox: Extent::empty(),
            rows: 0,
            cols: 0,
        }
    }

    /// Open the index covering `geometry`, resolving the file through
    /// `resolver` and applying the temporal window from `filters` during
    /// load.
    ///
    /// Re-opening is a no-op when the resolved path matches the current one
    /// and features are already loaded. On error the index is left empty;
    /// the caller records `INDEX_FILE_ERROR` on the request.
    pub fn open(
        &mut self,
        resolver: &dyn IndexResolver,
        geometry: &QueryGeometry,
        filters: &FilterConfig,
    ) -> Result<()> {
        let new_path = resolver.index_file(geometry);

        if self.path.as_ref() == Some(&new_path) && !self.features.is_empty() {
            return Ok(());
        }

        self.clear();

        let contents = std::fs::read_to_string(&new_path)
            .with_context(|| format!("Failed to open vector index file: {}", new_path.display()))?;
        let gj: GeoJson = contents
            .parse()
            .with_context(|| format!("Failed to parse vector index file: {}", new_path.display()))?;
        let fc = FeatureCollection::try_from(gj)
            .with_context(|| format!("Index file is not a feature collection: {}", new_path.display()))?;

        let mut features = Vec::new();
        let mut bbox = Extent::empty();

        for feature in fc.features {
            let Some(parsed) = parse_feature(&feature) else {
                continue;
            };

            // Temporal window filter; features with no date are kept
            if parsed.has_date && !date_in_window(&parsed.date, filters) {
                continue;
            }

            bbox = bbox.union(&parsed.envelope);
            features.push(parsed);
        }

        if features.is_empty() {
            bail!(
                "No usable features in vector index file: {}",
                new_path.display()
            );
        }

        tracing::debug!(
            "Loaded {} index features from {}, bbox ({:.6}, {:.6}) .. ({:.6}, {:.6})",
            features.len(),
            new_path.display(),
            bbox.min_x,
            bbox.min_y,
            bbox.max_x,
            bbox.max_y
        );

        self.path = Some(new_path);
        self.features = Arc::new(features);
        self.bbox = bbox;
        Ok(())
    }

    /// Drop all loaded features.
    pub fn clear(&mut self) {
        self.path = None;
        self.features = Arc::new(Vec::new());
        self.bbox = Extent::empty();
        self.rows = 0;
        self.cols = 0;
    }

    /// True iff features are loaded and the bbox fully contains the
    /// geometry. Geometry exactly on the bbox edge is contained.
    pub fn contains(&self, geometry: &QueryGeometry) -> bool {
        if self.features.is_empty() {
            return false;
        }
        match geometry {
            QueryGeometry::Point(p) => self.bbox.contains_point(p.x, p.y),
            QueryGeometry::Extent(e) => {
                self.bbox.contains_point(e.min_x, e.min_y)
                    && self.bbox.contains_point(e.max_x, e.max_y)
            }
        }
    }

    /// The loaded feature list, shareable with finder threads.
    pub fn features(&self) -> &Arc<Vec<IndexFeature>> {
        &self.features
    }

    /// Union bounding box of all loaded features.
    pub fn bbox(&self) -> Extent {
        self.bbox
    }

    /// Raster dimensions of hybrid index datasets; zero for plain vector
    /// layers.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

fn date_in_window(date: &DateTime<Utc>, filters: &FilterConfig) -> bool {
    if let Some(start) = &filters.time_start {
        if date < start {
            return false;
        }
    }
    if let Some(stop) = &filters.time_stop {
        if date > stop {
            return false;
        }
    }
    true
}

fn parse_feature(feature: &geojson::Feature) -> Option<IndexFeature> {
    let gj_geometry = feature.geometry.as_ref()?;
    let geometry = geo::Geometry::<f64>::try_from(gj_geometry).ok()?;

    let rect = geometry.bounding_rect()?;
    let envelope = Extent::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y);

    let properties = feature.properties.as_ref()?;
    let raster_path = properties.get(VALUE_FIELD)?.as_str()?;
    if raster_path.is_empty() {
        return None;
    }

    let flags_path = properties
        .get(FLAGS_FIELD)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let date = feature_date(properties);
    let (date, has_date) = match date {
        Some(d) => (d, true),
        None => (time::datetime_from_gps(0), false),
    };

    Some(IndexFeature {
        geometry,
        envelope,
        raster_path: raster_path.to_string(),
        flags_path,
        gps_time: if has_date { time::gps_from_datetime(&date) } else { 0 },
        date,
        has_date,
    })
}

/// Extract the feature date: a single `datetime`, or the arithmetic mean of
/// a `start_datetime`/`end_datetime` pair.
fn feature_date(properties: &geojson::JsonObject) -> Option<DateTime<Utc>> {
    if let Some(dt) = properties
        .get(DATE_FIELD)
        .and_then(|v| v.as_str())
        .and_then(time::parse_iso8601)
    {
        return Some(dt);
    }

    let start = properties
        .get(START_DATE_FIELD)
        .and_then(|v| v.as_str())
        .and_then(time::parse_iso8601)?;
    let end = properties
        .get(END_DATE_FIELD)
        .and_then(|v| v.as_str())
        .and_then(time::parse_iso8601)?;

    Some(time::mean_datetime(&start, &end))
}
