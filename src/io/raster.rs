//! Raster handle: a thin wrapper around a single raster dataset.
//!
//! A handle lazily opens its dataset on first use and keeps the
//! geotransform, its inverse, band/block geometry, and the CRS transform
//! from the request CRS into the raster's native CRS. Read failures never
//! escape as errors; they are recorded in the handle's error word and the
//! operation returns `None`.

use crate::config::{ResamplingAlg, SamplingConfig};
use crate::crs::{self, TransformCache};
use crate::errors;
use crate::geometry::{Extent, Point3};
use anyhow::{bail, Context, Result};
use gdal::raster::ResampleAlg;
use gdal::Dataset;
use ndarray::Array2;
use proj::Proj;
use std::sync::Arc;

/// Callback overriding the CRS a raster reports for itself. Receives the
/// dataset's projection (WKT, possibly empty) and returns a replacement CRS
/// definition, or `None` to keep the reported one.
pub type CrsOverride = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One sampled pixel value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Pixel value after resampling
    pub value: f64,

    /// Raster time in GPS seconds
    pub time: f64,

    /// Per-request file id of the raster
    pub file_id: u64,

    /// Value of the companion flags raster, when the group carries one
    pub flags: u32,

    /// Error bits recorded while producing this sample
    pub errors: u32,
}

/// A pixel rectangle read from a raster for an area of interest.
#[derive(Debug)]
pub struct RasterSubset {
    /// Bounds of the returned window, in the raster CRS
    pub bounds: Extent,

    /// File path of the backing raster
    pub raster_name: String,

    /// Pixel size in raster CRS units
    pub cell_size: f64,

    /// Pixel data, row-major with row 0 the first raster row in the window
    pub data: Array2<f64>,

    /// Error bits recorded while producing this subset
    pub errors: u32,
}

struct RasterState {
    dataset: Dataset,
    cols: usize,
    rows: usize,
    geo: [f64; 6],
    inv_geo: [f64; 6],
    bbox: Extent,
    cell_size: f64,
    block_size: (usize, usize),
    no_data: Option<f64>,
    /// Request CRS -> raster CRS; `None` when they match
    transform: Option<Arc<Proj>>,
}

/// A lazily-opened raster dataset with point-sampling and subsetting.
pub struct RasterHandle {
    path: String,
    gps_time: i64,
    file_id: u64,
    is_elevation: bool,
    algorithm: ResamplingAlg,
    radius_m: f64,
    transforms: Arc<TransformCache>,
    crs_override: Option<CrsOverride>,
    errors: u32,
    state: Option<RasterState>,
}

impl RasterHandle {
    pub fn new(
        sampling: &SamplingConfig,
        path: String,
        gps_time: i64,
        file_id: u64,
        is_elevation: bool,
        crs_override: Option<CrsOverride>,
        transforms: Arc<TransformCache>,
    ) -> Self {
        Self {
            path,
            gps_time,
            file_id,
            is_elevation,
            algorithm: sampling.algorithm,
            radius_m: sampling.radius_m,
            transforms,
            crs_override,
            errors: errors::NO_ERRORS,
            state: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn gps_time(&self) -> i64 {
        self.gps_time
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn is_elevation(&self) -> bool {
        self.is_elevation
    }

    /// Pixel size of the open dataset, `None` before first use.
    pub fn cell_size(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.cell_size)
    }

    /// Native block size of the open dataset, `None` before first use.
    pub fn block_size(&self) -> Option<(usize, usize)> {
        self.state.as_ref().map(|s| s.block_size)
    }

    /// Bounding box of the open dataset in its CRS, `None` before first use.
    pub fn bounding_box(&self) -> Option<Extent> {
        self.state.as_ref().map(|s| s.bbox)
    }

    /// Read and clear the handle's error word.
    pub fn error(&mut self) -> u32 {
        let word = self.errors;
        self.errors = errors::NO_ERRORS;
        word
    }

    /// Sample the raster at a geographic point.
    ///
    /// Returns `None` when the point lies outside the raster's bounding box
    /// (not an error) or when the read fails (error word updated).
    pub fn sample(&mut self, point: &Point3) -> Option<Sample> {
        if !self.ensure_open() {
            return None;
        }
        let state = self.state.as_ref()?;

        let mut err = errors::NO_ERRORS;
        let sample = sample_state(
            state,
            point,
            self.algorithm,
            self.radius_m,
            self.gps_time,
            self.file_id,
            &mut err,
        );
        self.errors |= err;
        sample
    }

    /// Read the pixel rectangle overlapping an extent (in the request CRS).
    ///
    /// Returns `None` on empty intersection or read failure.
    pub fn subset(&mut self, extent: &Extent) -> Option<RasterSubset> {
        if !self.ensure_open() {
            return None;
        }
        let state = self.state.as_ref()?;

        let mut err = errors::NO_ERRORS;
        let subset = subset_state(state, extent, &self.path, &mut err);
        self.errors |= err;
        subset
    }

    fn ensure_open(&mut self) -> bool {
        if self.state.is_some() {
            return true;
        }
        match self.open() {
            Ok(state) => {
                self.state = Some(state);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to open raster {}: {:#}", self.path, e);
                if self.errors & errors::CRS_TRANSFORM_ERROR == 0 {
                    self.errors |= errors::READ_ERROR;
                }
                false
            }
        }
    }

    fn open(&mut self) -> Result<RasterState> {
        let dataset = Dataset::open(&self.path)
            .with_context(|| format!("Failed to open raster: {}", self.path))?;

        let (cols, rows) = dataset.raster_size();
        let geo = dataset
            .geo_transform()
            .with_context(|| format!("Raster has no geotransform: {}", self.path))?;
        let inv_geo = invert_geotransform(&geo)?;
        let bbox = geotransform_bbox(&geo, cols, rows);
        let cell_size = geo[1].abs();

        let (block_size, no_data) = {
            let band = dataset
                .rasterband(1)
                .with_context(|| format!("Raster has no band 1: {}", self.path))?;
            (band.block_size(), band.no_data_value())
        };

        let mut raster_crs = dataset.projection();
        if let Some(cb) = &self.crs_override {
            if let Some(replacement) = cb(&raster_crs) {
                raster_crs = replacement;
            }
        }

        let transform = if raster_crs.is_empty() || raster_crs == self.transforms.input_crs() {
            None
        } else {
            match self.transforms.get(&raster_crs) {
                Ok(t) => Some(t),
                Err(e) => {
                    self.errors |= errors::CRS_TRANSFORM_ERROR;
                    return Err(e);
                }
            }
        };

        tracing::debug!(
            "Opened raster {} ({}x{}, block {}x{}, cell {})",
            self.path,
            cols,
            rows,
            block_size.0,
            block_size.1,
            cell_size
        );

        Ok(RasterState {
            dataset,
            cols,
            rows,
            geo,
            inv_geo,
            bbox,
            cell_size,
            block_size,
            no_data,
            transform,
        })
    }
}

fn sample_state(
    state: &RasterState,
    point: &Point3,
    algorithm: ResamplingAlg,
    radius_m: f64,
    gps_time: i64,
    file_id: u64,
    err: &mut u32,
) -> Option<Sample> {
    let (x, y) = match &state.transform {
        None => (point.x, point.y),
        Some(t) => match t.convert((point.x, point.y)) {
            Ok(p) => p,
            Err(_) => {
                *err |= errors::CRS_TRANSFORM_ERROR;
                return None;
            }
        },
    };

    if !state.bbox.contains_point(x, y) {
        return None;
    }

    let col = (state.inv_geo[0] + state.inv_geo[1] * x + state.inv_geo[2] * y).floor() as isize;
    let row = (state.inv_geo[3] + state.inv_geo[4] * x + state.inv_geo[5] * y).floor() as isize;

    // A point on the bbox edge lands within one pixel of the raster; more
    // than that means the geotransform disagrees with the bbox
    if col < -1 || row < -1 || col > state.cols as isize || row > state.rows as isize {
        *err |= errors::OUT_OF_BOUNDS_ERROR;
        return None;
    }
    let col = col.clamp(0, state.cols as isize - 1);
    let row = row.clamp(0, state.rows as isize - 1);

    let value = match read_pixel(state, col, row, algorithm, radius_m) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Read failed at ({}, {}): {:#}", col, row, e);
            *err |= errors::READ_ERROR;
            return None;
        }
    };

    if value.is_nan() || state.no_data.map_or(false, |nd| value == nd) {
        *err |= errors::NODATA_ERROR;
        return None;
    }

    Some(Sample {
        value,
        time: gps_time as f64,
        file_id,
        flags: 0,
        errors: errors::NO_ERRORS,
    })
}

fn read_pixel(
    state: &RasterState,
    col: isize,
    row: isize,
    algorithm: ResamplingAlg,
    radius_m: f64,
) -> Result<f64> {
    if algorithm == ResamplingAlg::Nearest {
        return read_window(state, (col, row), (1, 1), None);
    }

    // Round the radius up to a multiple of the cell size, then expand it
    // into a (2r+1)x(2r+1) pixel window
    let radius_px = if radius_m <= 0.0 {
        1
    } else {
        (radius_m / state.cell_size).ceil() as isize
    };
    let size = 2 * radius_px + 1;
    let c0 = col - radius_px;
    let r0 = row - radius_px;

    if c0 < 0
        || r0 < 0
        || c0 + size > state.cols as isize
        || r0 + size > state.rows as isize
    {
        // Kernel window crosses the raster boundary: nearest at the center
        return read_window(state, (col, row), (1, 1), None);
    }

    read_window(
        state,
        (c0, r0),
        (size as usize, size as usize),
        Some(to_gdal_alg(algorithm)),
    )
}

/// Read a window resampled into a single pixel, retrying once on transient
/// failure.
fn read_window(
    state: &RasterState,
    offset: (isize, isize),
    window: (usize, usize),
    resample: Option<ResampleAlg>,
) -> Result<f64> {
    let band = state.dataset.rasterband(1)?;

    let mut attempt = 0;
    loop {
        match band.read_as::<f64>(offset, window, (1, 1), resample) {
            Ok(buf) => {
                return buf
                    .data
                    .first()
                    .copied()
                    .context("Empty read buffer");
            }
            Err(_) if attempt == 0 => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

fn subset_state(
    state: &RasterState,
    extent: &Extent,
    path: &str,
    err: &mut u32,
) -> Option<RasterSubset> {
    let target = match &state.transform {
        None => *extent,
        Some(t) => match crs::transform_extent_with(extent, t) {
            Ok(e) => e,
            Err(_) => {
                *err |= errors::CRS_TRANSFORM_ERROR;
                return None;
            }
        },
    };

    let overlap = target.intersect(&state.bbox)?;

    // Pixel window covering the overlap
    let mut min_col = f64::MAX;
    let mut min_row = f64::MAX;
    let mut max_col = f64::MIN;
    let mut max_row = f64::MIN;
    for (x, y) in [
        (overlap.min_x, overlap.min_y),
        (overlap.max_x, overlap.min_y),
        (overlap.max_x, overlap.max_y),
        (overlap.min_x, overlap.max_y),
    ] {
        let c = state.inv_geo[0] + state.inv_geo[1] * x + state.inv_geo[2] * y;
        let r = state.inv_geo[3] + state.inv_geo[4] * x + state.inv_geo[5] * y;
        min_col = min_col.min(c);
        min_row = min_row.min(r);
        max_col = max_col.max(c);
        max_row = max_row.max(r);
    }

    let c0 = (min_col.floor() as isize).max(0);
    let r0 = (min_row.floor() as isize).max(0);
    let c1 = (max_col.ceil() as isize).min(state.cols as isize);
    let r1 = (max_row.ceil() as isize).min(state.rows as isize);

    let width = (c1 - c0).max(1) as usize;
    let height = (r1 - r0).max(1) as usize;

    let band = match state.dataset.rasterband(1) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Subset read failed on {}: {:#}", path, e);
            *err |= errors::READ_ERROR;
            return None;
        }
    };

    let mut attempt = 0;
    let buf = loop {
        match band.read_as::<f64>((c0, r0), (width, height), (width, height), None) {
            Ok(buf) => break buf,
            Err(_) if attempt == 0 => attempt += 1,
            Err(e) => {
                tracing::warn!("Subset read failed on {}: {:#}", path, e);
                *err |= errors::READ_ERROR;
                return None;
            }
        }
    };

    let data = match Array2::from_shape_vec((height, width), buf.data) {
        Ok(a) => a,
        Err(_) => {
            *err |= errors::READ_ERROR;
            return None;
        }
    };

    // Geographic bounds of the returned pixel window
    let mut bounds = Extent::empty();
    for (c, r) in [(c0, r0), (c1, r0), (c0, r1), (c1, r1)] {
        let x = state.geo[0] + state.geo[1] * c as f64 + state.geo[2] * r as f64;
        let y = state.geo[3] + state.geo[4] * c as f64 + state.geo[5] * r as f64;
        bounds = bounds.union(&Extent::new(x, y, x, y));
    }

    Some(RasterSubset {
        bounds,
        raster_name: path.to_string(),
        cell_size: state.cell_size,
        data,
        errors: errors::NO_ERRORS,
    })
}

fn to_gdal_alg(algorithm: ResamplingAlg) -> ResampleAlg {
    match algorithm {
        ResamplingAlg::Nearest => ResampleAlg::NearestNeighbour,
        ResamplingAlg::Bilinear => ResampleAlg::Bilinear,
        ResamplingAlg::Cubic => ResampleAlg::Cubic,
        ResamplingAlg::CubicSpline => ResampleAlg::CubicSpline,
        ResamplingAlg::Lanczos => ResampleAlg::Lanczos,
        ResamplingAlg::Average => ResampleAlg::Average,
        ResamplingAlg::Mode => ResampleAlg::Mode,
        ResamplingAlg::Gauss => ResampleAlg::Gauss,
    }
}

/// Invert a GDAL-style geotransform.
fn invert_geotransform(geo: &[f64; 6]) -> Result<[f64; 6]> {
    let det = geo[1] * geo[5] - geo[2] * geo[4];
    if det.abs() < 1e-15 {
        bail!("Geotransform is not invertible");
    }

    Ok([
        (geo[2] * geo[3] - geo[5] * geo[0]) / det,
        geo[5] / det,
        -geo[2] / det,
        (geo[4] * geo[0] - geo[1] * geo[3]) / det,
        -geo[4] / det,
        geo[1] / det,
    ])
}

/// Bounding box of a raster from its geotransform and dimensions.
fn geotransform_bbox(geo: &[f64; 6], cols: usize, rows: usize) -> Extent {
    let mut bbox = Extent::empty();
    for (c, r) in [(0, 0), (cols, 0), (0, rows), (cols, rows)] {
        let x = geo[0] + geo[1] * c as f64 + geo[2] * r as f64;
        let y = geo[3] + geo[4] * c as f64 + geo[5] * r as f64;
        bbox = bbox.union(&Extent::new(x, y, x, y));
    }
    bbox
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::create_test_raster;
    use std::path::Path;

    /// 10x10 raster, origin (0, 0), cell 1.0, rows increasing northward, so
    /// geographic (x, y) maps to pixel (floor(x), floor(y)).
    fn make_grid(dir: &Path, name: &str, center: Option<(usize, usize, f64)>) -> String {
        let mut values = vec![1.0; 100];
        if let Some((col, row, v)) = center {
            values[row * 10 + col] = v;
        }
        let path = dir.join(name);
        create_test_raster(&path, 10, 10, [0.0, 1.0, 0.0, 0.0, 0.0, 1.0], values, None);
        path.to_string_lossy().into_owned()
    }

    fn make_handle(path: String, algorithm: ResamplingAlg, radius_m: f64) -> RasterHandle {
        let sampling = SamplingConfig {
            algorithm,
            radius_m,
            ..SamplingConfig::default()
        };
        let transforms = Arc::new(TransformCache::new(&sampling.input_crs));
        RasterHandle::new(&sampling, path, 1_000_000, 1, true, None, transforms)
    }

    #[test]
    fn test_nearest_neighbor_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_grid(dir.path(), "grid.tif", Some((3, 4, 42.0)));

        let mut handle = make_handle(path, ResamplingAlg::Nearest, 0.0);
        let sample = handle.sample(&Point3::new(3.7, 4.2, 0.0)).unwrap();

        assert_eq!(sample.value, 42.0);
        assert_eq!(sample.file_id, 1);
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_point_outside_bbox_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_grid(dir.path(), "grid.tif", None);

        let mut handle = make_handle(path, ResamplingAlg::Nearest, 0.0);
        assert!(handle.sample(&Point3::new(100.0, 5.0, 0.0)).is_none());
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_point_on_far_edge_clamps_to_last_pixel() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_grid(dir.path(), "grid.tif", Some((9, 9, 7.0)));

        let mut handle = make_handle(path, ResamplingAlg::Nearest, 0.0);
        let sample = handle.sample(&Point3::new(10.0, 10.0, 0.0)).unwrap();
        assert_eq!(sample.value, 7.0);
    }

    #[test]
    fn test_nodata_sets_error_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodata.tif");
        create_test_raster(
            &path,
            10,
            10,
            [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            vec![-9999.0; 100],
            Some(-9999.0),
        );

        let mut handle = make_handle(
            path.to_string_lossy().into_owned(),
            ResamplingAlg::Nearest,
            0.0,
        );
        assert!(handle.sample(&Point3::new(5.0, 5.0, 0.0)).is_none());
        assert_eq!(handle.error() & errors::NODATA_ERROR, errors::NODATA_ERROR);
        // error() clears the word
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_missing_file_sets_read_error() {
        let mut handle = make_handle(
            "/nonexistent/raster.tif".to_string(),
            ResamplingAlg::Nearest,
            0.0,
        );
        assert!(handle.sample(&Point3::new(0.0, 0.0, 0.0)).is_none());
        assert_eq!(handle.error() & errors::READ_ERROR, errors::READ_ERROR);
    }

    #[test]
    fn test_kernel_resampling_on_constant_raster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.tif");
        create_test_raster(
            &path,
            10,
            10,
            [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            vec![3.5; 100],
            None,
        );

        let mut handle = make_handle(
            path.to_string_lossy().into_owned(),
            ResamplingAlg::Bilinear,
            2.0,
        );
        let sample = handle.sample(&Point3::new(5.5, 5.5, 0.0)).unwrap();
        assert!((sample.value - 3.5).abs() < 1e-12);
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_kernel_window_at_boundary_falls_back_to_nearest() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_grid(dir.path(), "grid.tif", Some((0, 0, 9.0)));

        let mut handle = make_handle(path, ResamplingAlg::Cubic, 3.0);
        let sample = handle.sample(&Point3::new(0.5, 0.5, 0.0)).unwrap();
        assert_eq!(sample.value, 9.0);
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_subset_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.tif");
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        create_test_raster(&path, 10, 10, [0.0, 1.0, 0.0, 0.0, 0.0, 1.0], values, None);

        let mut handle = make_handle(
            path.to_string_lossy().into_owned(),
            ResamplingAlg::Nearest,
            0.0,
        );
        let subset = handle
            .subset(&Extent::new(2.0, 3.0, 5.0, 6.0))
            .unwrap();

        assert_eq!(subset.data.dim(), (3, 3));
        // First window pixel is (col 2, row 3) = 3*10+2
        assert_eq!(subset.data[[0, 0]], 32.0);
        assert_eq!(subset.cell_size, 1.0);
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_subset_empty_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_grid(dir.path(), "grid.tif", None);

        let mut handle = make_handle(path, ResamplingAlg::Nearest, 0.0);
        assert!(handle
            .subset(&Extent::new(100.0, 100.0, 110.0, 110.0))
            .is_none());
        assert_eq!(handle.error(), errors::NO_ERRORS);
    }

    #[test]
    fn test_invert_geotransform_roundtrip() {
        let geo = [453000.0, 2.0, 0.0, 7_230_000.0, 0.0, -2.0];
        let inv = invert_geotransform(&geo).unwrap();

        let (col, row) = (123.0, 456.0);
        let x = geo[0] + geo[1] * col + geo[2] * row;
        let y = geo[3] + geo[4] * col + geo[5] * row;
        let back_col = inv[0] + inv[1] * x + inv[2] * y;
        let back_row = inv[3] + inv[4] * x + inv[5] * y;

        assert!((back_col - col).abs() < 1e-9);
        assert!((back_row - row).abs() < 1e-9);
    }

    #[test]
    fn test_handle_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<RasterHandle>();
    }
}
