//! I/O: raster handles, the handle cache, and gridded masks.

mod handle_cache;
mod masks;
mod raster;

pub use handle_cache::{CacheEntry, HandleCache, SharedEntry};
pub use masks::{
    GridSpec, SubaqueousMask, WaterRiMask, BATHYMETRY_GRID, BATHYMETRY_MASK_OFF_VALUE,
    WATER_RI_GRID,
};
pub use raster::{CrsOverride, RasterHandle, RasterSubset, Sample};
