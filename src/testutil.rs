//! Shared test fixtures.

use gdal::raster::Buffer;
use gdal::DriverManager;
use std::path::Path;

/// Create a single-band float64 GTiff.
pub fn create_test_raster(
    path: &Path,
    width: usize,
    height: usize,
    geo: [f64; 6],
    values: Vec<f64>,
    no_data: Option<f64>,
) {
    let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
    let mut dataset = driver
        .create_with_band_type::<f64, _>(path, width as isize, height as isize, 1)
        .unwrap();
    dataset.set_geo_transform(&geo).unwrap();

    let mut band = dataset.rasterband(1).unwrap();
    if no_data.is_some() {
        band.set_no_data_value(no_data).unwrap();
    }
    band.write((0, 0), (width, height), &Buffer::new((width, height), values))
        .unwrap();
}

/// Create a single-band uint32 GTiff (bitmask fixtures).
pub fn create_test_raster_u32(
    path: &Path,
    width: usize,
    height: usize,
    geo: [f64; 6],
    values: Vec<u32>,
) {
    let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
    let mut dataset = driver
        .create_with_band_type::<u32, _>(path, width as isize, height as isize, 1)
        .unwrap();
    dataset.set_geo_transform(&geo).unwrap();

    let mut band = dataset.rasterband(1).unwrap();
    band.write((0, 0), (width, height), &Buffer::new((width, height), values))
        .unwrap();
}
