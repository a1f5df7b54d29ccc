//! Configuration for the sampling engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a sampler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Sampling configuration
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Raster group post-filters
    #[serde(default)]
    pub filters: FilterConfig,

    /// Thread and cache limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Refraction correction parameters
    #[serde(default)]
    pub refraction: RefractionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            filters: FilterConfig::default(),
            limits: LimitsConfig::default(),
            refraction: RefractionConfig::default(),
        }
    }
}

/// Pixel resampling algorithm, matching the GDAL kernel family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingAlg {
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
}

impl Default for ResamplingAlg {
    fn default() -> Self {
        ResamplingAlg::Nearest
    }
}

/// How rasters are opened and pixels are read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Resampling algorithm for point sampling
    #[serde(default)]
    pub algorithm: ResamplingAlg,

    /// Kernel radius in meters; rounded up to a multiple of the cell size.
    /// Ignored for nearest-neighbor.
    #[serde(default)]
    pub radius_m: f64,

    /// CRS of request points and index features
    #[serde(default = "default_input_crs")]
    pub input_crs: String,

    /// Sample the companion flags raster of each group and attach its value
    /// to the group's value sample
    #[serde(default)]
    pub flags_file: bool,

    /// Treat sampled values as generic measurements even when the dataset is
    /// an elevation product
    #[serde(default)]
    pub force_not_elevation: bool,

    /// Use each point's own GPS time as the closest-time target in batch
    /// requests
    #[serde(default = "default_true")]
    pub use_poi_time: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            algorithm: ResamplingAlg::default(),
            radius_m: 0.0,
            input_crs: default_input_crs(),
            flags_file: false,
            force_not_elevation: false,
            use_poi_time: true,
        }
    }
}

/// Day-of-year window with a keep/exclude toggle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoyRange {
    /// First day of year in the window (1-based)
    pub start: u32,

    /// Last day of year in the window; `start > end` wraps across the year
    /// boundary
    pub end: u32,

    /// Keep groups inside the window (true) or outside of it (false)
    #[serde(default = "default_true")]
    pub keep_inrange: bool,
}

/// Raster group post-filters applied on the controller thread.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Temporal window start; features dated before it are dropped at index
    /// load
    #[serde(default)]
    pub time_start: Option<DateTime<Utc>>,

    /// Temporal window stop
    #[serde(default)]
    pub time_stop: Option<DateTime<Utc>>,

    /// Keep only groups whose raster paths all contain this substring.
    /// An empty substring disables the filter.
    #[serde(default)]
    pub url_substring: Option<String>,

    /// Day-of-year window
    #[serde(default)]
    pub doy_range: Option<DoyRange>,

    /// Per-request closest-time target; a per-point GPS time takes
    /// precedence when present
    #[serde(default)]
    pub closest_time: Option<DateTime<Utc>>,
}

/// Thread and cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent raster reader threads; a request needing more is
    /// aborted
    #[serde(default = "default_max_reader_threads")]
    pub max_reader_threads: usize,

    /// Fixed size of the finder thread pool
    #[serde(default = "default_max_finder_threads")]
    pub max_finder_threads: usize,

    /// Minimum features per finder thread before the feature list is split
    #[serde(default = "default_min_features_per_finder")]
    pub min_features_per_finder: usize,

    /// Handle cache size above which disabled entries are pruned
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Defensive bound on condition-variable waits, in milliseconds
    #[serde(default = "default_sys_timeout_ms")]
    pub sys_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_reader_threads: default_max_reader_threads(),
            max_finder_threads: default_max_finder_threads(),
            min_features_per_finder: default_min_features_per_finder(),
            max_cache_size: default_max_cache_size(),
            sys_timeout_ms: default_sys_timeout_ms(),
        }
    }
}

/// Subaqueous refraction correction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefractionConfig {
    /// Refractive index of air
    #[serde(default = "default_ri_air")]
    pub ri_air: f64,

    /// Refractive index of water, used when the mask is disabled or the
    /// photon falls off the mask
    #[serde(default = "default_ri_water")]
    pub ri_water: f64,

    /// Sample the per-photon water refractive index from the global mask
    #[serde(default)]
    pub use_water_ri_mask: bool,

    /// Path of the global water refractive index geotiff
    #[serde(default = "default_water_ri_mask_path")]
    pub water_ri_mask_path: PathBuf,
}

impl Default for RefractionConfig {
    fn default() -> Self {
        Self {
            ri_air: default_ri_air(),
            ri_water: default_ri_water(),
            use_water_ri_mask: false,
            water_ri_mask_path: default_water_ri_mask_path(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sampling.radius_m < 0.0 {
            anyhow::bail!("Sampling radius must be >= 0");
        }
        if self.sampling.input_crs.is_empty() {
            anyhow::bail!("Input CRS must not be empty");
        }
        if self.limits.max_reader_threads == 0 {
            anyhow::bail!("Reader thread cap must be > 0");
        }
        if self.limits.max_finder_threads == 0 {
            anyhow::bail!("Finder thread count must be > 0");
        }
        if self.limits.min_features_per_finder == 0 {
            anyhow::bail!("Minimum features per finder thread must be > 0");
        }
        if let Some(doy) = &self.filters.doy_range {
            if doy.start == 0 || doy.start > 366 || doy.end == 0 || doy.end > 366 {
                anyhow::bail!("Day-of-year range values must be in 1..=366");
            }
        }
        if let (Some(start), Some(stop)) = (&self.filters.time_start, &self.filters.time_stop) {
            if start > stop {
                anyhow::bail!("Temporal window start must not be after stop");
            }
        }
        if self.refraction.ri_air <= 0.0 || self.refraction.ri_water <= 0.0 {
            anyhow::bail!("Refractive indices must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_true() -> bool { true }
fn default_input_crs() -> String { crate::crs::codes::WGS84.to_string() }
fn default_max_reader_threads() -> usize { 200 }
fn default_max_finder_threads() -> usize { 8 }
fn default_min_features_per_finder() -> usize { 1000 }
fn default_max_cache_size() -> usize { 200 }
fn default_sys_timeout_ms() -> u64 { 10_000 }
fn default_ri_air() -> f64 { 1.00029 }
fn default_ri_water() -> f64 { 1.34116 }
fn default_water_ri_mask_path() -> PathBuf { PathBuf::from("/data/cop_rep_ANNUAL_meanRI_d00.tif") }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sampling.algorithm, ResamplingAlg::Nearest);
        assert_eq!(config.limits.max_reader_threads, 200);
        assert_eq!(config.limits.max_finder_threads, 8);
        assert_eq!(config.limits.min_features_per_finder, 1000);
        assert!((config.refraction.ri_water - 1.34116).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
sampling:
  algorithm: bilinear
  radius_m: 30.0
  flags_file: true
filters:
  url_substring: "arcticdem"
  doy_range:
    start: 152
    end: 244
limits:
  max_reader_threads: 16
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.sampling.algorithm, ResamplingAlg::Bilinear);
        assert_eq!(config.sampling.radius_m, 30.0);
        assert!(config.sampling.flags_file);
        assert_eq!(config.filters.url_substring.as_deref(), Some("arcticdem"));
        assert_eq!(config.limits.max_reader_threads, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sampling.radius_m = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_reader_threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.filters.doy_range = Some(DoyRange {
            start: 0,
            end: 400,
            keep_inrange: true,
        });
        assert!(config.validate().is_err());
    }
}
