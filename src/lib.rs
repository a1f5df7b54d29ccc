//! Geo-Indexed Raster Sampling Engine
//!
//! The compute core of a laser-altimetry processing service: it resolves
//! geographic points and areas of interest against vector index files
//! describing which raster tiles cover which geometry, reads the matching
//! pixels through a multi-threaded reader pipeline, and applies the
//! subaqueous refraction correction to photon data frames.
//!
//! # Architecture
//!
//! - **Index**: geojson vector indexes cloned into plain feature lists,
//!   raster groups, and their insertion-ordered per-request mapping
//! - **I/O**: lazily-opened GDAL raster handles, the bounded handle cache,
//!   and the global water-RI / bathymetry masks
//! - **Sampler**: the controller that fans requests across the finder pool,
//!   applies post-filters, and dispatches the reader or batch-reader pool
//! - **Refraction**: the per-photon Snell's-law pass on its own worker
//!   thread
//!
//! All pools are long-lived OS threads parked on condition variables
//! between requests; worker failures surface as error-word bits, never as
//! panics or cross-thread exceptions.
//!
//! # Usage
//!
//! ```no_run
//! use geosample::{Config, FixedResolver, Point3, Sampler};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let resolver = Box::new(FixedResolver::new("/data/arcticdem/mosaic.geojson"));
//!     let mut sampler = Sampler::new(config, resolver, None)?;
//!
//!     let result = sampler.sample_point(Point3::new(-150.0, 70.0, 0.0), 0);
//!     for sample in &result.samples {
//!         println!("{} @ {}", sample.value, sample.time);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crs;
pub mod errors;
pub mod geometry;
pub mod index;
pub mod io;
pub mod refraction;
pub mod sampler;
pub mod time;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Config, DoyRange, FilterConfig, LimitsConfig, RefractionConfig, ResamplingAlg, SamplingConfig};
pub use geometry::{Extent, Point3, PointInfo, QueryGeometry};
pub use index::{FixedResolver, GeocellResolver, GroupOrdering, IndexResolver, RasterGroup, RasterTag};
pub use io::{CrsOverride, HandleCache, RasterHandle, RasterSubset, Sample, SubaqueousMask, WaterRiMask};
pub use refraction::{correct_frame, PhotonFrame, RefractionCorrector};
pub use sampler::{BatchSamples, CancelHandle, FileDict, SampleSet, Sampler, SubsetSet};
