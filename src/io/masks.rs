//! Global gridded masks.
//!
//! Two fixed-grid geotiffs are consulted per photon: the water refractive
//! index mask (float64, row 0 = north edge, so row indexing is flipped) and
//! the subaqueous bathymetry mask (uint32, row 0 = south edge). Both cover
//! the globe at 0.25° but with different latitude extents; points falling
//! off a mask get the caller's fallback behavior.

use anyhow::{Context, Result};
use gdal::Dataset;
use std::path::Path;

/// Geometry of a fixed global grid.
#[derive(Debug, Clone, Copy)]
pub struct GridSpec {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
    pub pixel_size: f64,
    /// Whether image row 0 is the north edge (flipped row indexing)
    pub row0_north: bool,
}

/// Grid of the global water refractive index mask.
pub const WATER_RI_GRID: GridSpec = GridSpec {
    min_lon: -180.0,
    max_lon: 180.0,
    min_lat: -78.75,
    max_lat: 90.0,
    pixel_size: 0.25,
    row0_north: true,
};

/// Grid of the global bathymetry mask.
pub const BATHYMETRY_GRID: GridSpec = GridSpec {
    min_lon: -180.0,
    max_lon: 180.0,
    min_lat: -79.0,
    max_lat: 84.25,
    pixel_size: 0.25,
    row0_north: false,
};

/// Bathymetry mask pixel value meaning "not bathy".
pub const BATHYMETRY_MASK_OFF_VALUE: u32 = 0xFFFF_FFFF;

struct GridMask {
    dataset: Dataset,
    width: usize,
    height: usize,
    grid: GridSpec,
}

impl GridMask {
    fn open(path: &Path, grid: GridSpec) -> Result<Self> {
        let dataset = Dataset::open(path)
            .with_context(|| format!("Failed to open mask: {}", path.display()))?;
        let (width, height) = dataset.raster_size();
        Ok(Self {
            dataset,
            width,
            height,
            grid,
        })
    }

    /// Image pixel for a geographic point, or `None` off the grid.
    fn pixel(&self, lon: f64, lat: f64) -> Option<(usize, usize)> {
        let x = ((lon - self.grid.min_lon) / self.grid.pixel_size).floor() as i64;
        let lat_rows = ((lat - self.grid.min_lat) / self.grid.pixel_size).floor() as i64;

        let y = if self.grid.row0_north {
            self.height as i64 - lat_rows
        } else {
            lat_rows
        };

        if x < 0 || x >= self.width as i64 || y < 0 || y >= self.height as i64 {
            return None;
        }
        Some((x as usize, y as usize))
    }

    fn read_f64(&self, x: usize, y: usize) -> Option<f64> {
        let band = self.dataset.rasterband(1).ok()?;
        let buf = band
            .read_as::<f64>((x as isize, y as isize), (1, 1), (1, 1), None)
            .ok()?;
        buf.data.first().copied()
    }

    fn read_u32(&self, x: usize, y: usize) -> Option<u32> {
        let band = self.dataset.rasterband(1).ok()?;
        let buf = band
            .read_as::<u32>((x as isize, y as isize), (1, 1), (1, 1), None)
            .ok()?;
        buf.data.first().copied()
    }
}

/// The global water refractive index mask (float64, row 0 = north).
pub struct WaterRiMask {
    mask: GridMask,
}

impl WaterRiMask {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_grid(path, WATER_RI_GRID)
    }

    /// Open with a non-standard grid (test fixtures).
    pub fn open_with_grid<P: AsRef<Path>>(path: P, grid: GridSpec) -> Result<Self> {
        Ok(Self {
            mask: GridMask::open(path.as_ref(), grid)?,
        })
    }

    /// Water refractive index at a point, or `None` off the mask.
    pub fn refractive_index(&self, lon: f64, lat: f64) -> Option<f64> {
        let (x, y) = self.mask.pixel(lon, lat)?;
        let value = self.mask.read_f64(x, y)?;
        if value.is_nan() {
            return None;
        }
        Some(value)
    }
}

/// The global bathymetry mask (uint32, row 0 = south).
pub struct SubaqueousMask {
    mask: GridMask,
}

impl SubaqueousMask {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_grid(path, BATHYMETRY_GRID)
    }

    /// Open with a non-standard grid (test fixtures).
    pub fn open_with_grid<P: AsRef<Path>>(path: P, grid: GridSpec) -> Result<Self> {
        Ok(Self {
            mask: GridMask::open(path.as_ref(), grid)?,
        })
    }

    /// Raw mask value at a point, or `None` off the mask.
    pub fn flag_value(&self, lon: f64, lat: f64) -> Option<u32> {
        let (x, y) = self.mask.pixel(lon, lat)?;
        self.mask.read_u32(x, y)
    }

    /// Whether a point is flagged as bathymetry. Off-mask points are not.
    pub fn is_bathy(&self, lon: f64, lat: f64) -> bool {
        matches!(self.flag_value(lon, lat), Some(v) if v != BATHYMETRY_MASK_OFF_VALUE)
    }
}
