//! Sampling controller and its worker pools.
//!
//! The [`Sampler`] owns the vector index, the raster handle cache, and the
//! finder/reader pools for one consumer. A request flows index open →
//! finder fan-out → post-filters → cache update → reader dispatch → harvest
//! in group-iteration order, so the output list order for a single point is
//! deterministic. Batch requests take the unique-raster path instead, with
//! one batch reader thread per physical raster.

mod batch;
mod filters;
mod finder;
mod reader;

pub use batch::{BatchReaderPool, PointSample, UniqueRaster};
pub use finder::{FinderPool, GroupOptions};
pub use reader::{ReadTask, ReaderPool};

use crate::config::Config;
use crate::crs::TransformCache;
use crate::errors;
use crate::geometry::{Extent, Point3, PointInfo, QueryGeometry};
use crate::index::{GroupOrdering, IndexResolver, RasterGroup, VectorIndex};
use crate::io::{CrsOverride, HandleCache, RasterHandle, RasterSubset, Sample, SharedEntry};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Samples returned for a single point or AOI request.
#[derive(Debug, Default)]
pub struct SampleSet {
    /// Samples in group-iteration order
    pub samples: Vec<Sample>,
    /// Request error word
    pub errors: u32,
}

/// Subsets returned for an AOI request.
#[derive(Debug, Default)]
pub struct SubsetSet {
    pub subsets: Vec<RasterSubset>,
    pub errors: u32,
}

/// Per-point sample lists returned for a batch request.
#[derive(Debug, Default)]
pub struct BatchSamples {
    /// One sample list per input point, in input order. Empty when the
    /// request was cancelled.
    pub points: Vec<Vec<Sample>>,
    pub errors: u32,
    pub stats: BatchStats,
}

/// Stage timings of a batch request.
#[derive(Debug, Default, Clone)]
pub struct BatchStats {
    pub find_secs: f64,
    pub dedup_secs: f64,
    pub assign_secs: f64,
    pub sample_secs: f64,
    pub assemble_secs: f64,
    pub unique_rasters: usize,
    pub total_point_refs: usize,
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "find: {:.3}s, dedup: {:.3}s, assign: {:.3}s, sample: {:.3}s, assemble: {:.3}s, rasters: {}, point refs: {}",
            self.find_secs,
            self.dedup_secs,
            self.assign_secs,
            self.sample_secs,
            self.assemble_secs,
            self.unique_rasters,
            self.total_point_refs
        )
    }
}

/// Per-request mapping from raster path to a stable file id, exposed to
/// callers for record serialization.
#[derive(Debug, Default)]
pub struct FileDict {
    ids: HashMap<String, u64>,
    paths: Vec<String>,
}

impl FileDict {
    pub fn add(&mut self, path: &str) -> u64 {
        if let Some(id) = self.ids.get(path) {
            return *id;
        }
        let id = self.paths.len() as u64;
        self.ids.insert(path.to_string(), id);
        self.paths.push(path.to_string());
        id
    }

    pub fn path(&self, id: u64) -> Option<&str> {
        self.paths.get(id as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u64, p.as_str()))
    }
}

/// Cloneable handle for cancelling a sampler's in-flight work.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Stop the owning sampler. Batch requests short-circuit at the next
    /// batch boundary and return an empty list.
    pub fn cancel(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct PointGroups {
    point: Point3,
    index: usize,
    groups: GroupOrdering,
}

/// Orchestrates vector index lookup, raster reads, and result assembly.
pub struct Sampler {
    config: Config,
    resolver: Box<dyn IndexResolver>,
    crs_override: Option<CrsOverride>,
    index: VectorIndex,
    cache: HandleCache,
    transforms: Arc<TransformCache>,
    finders: FinderPool,
    readers: ReaderPool,
    file_dict: FileDict,
    active: Arc<AtomicBool>,
    errors: u32,
}

impl Sampler {
    pub fn new(
        config: Config,
        resolver: Box<dyn IndexResolver>,
        crs_override: Option<CrsOverride>,
    ) -> Result<Self> {
        config.validate()?;

        let sys_timeout = Duration::from_millis(config.limits.sys_timeout_ms);
        let finders = FinderPool::new(
            config.limits.max_finder_threads,
            config.limits.min_features_per_finder,
            sys_timeout,
        )?;
        let readers = ReaderPool::new(sys_timeout);
        let cache = HandleCache::new(config.limits.max_cache_size);
        let transforms = Arc::new(TransformCache::new(&config.sampling.input_crs));

        Ok(Self {
            config,
            resolver,
            crs_override,
            index: VectorIndex::new(),
            cache,
            transforms,
            finders,
            readers,
            file_dict: FileDict::default(),
            active: Arc::new(AtomicBool::new(true)),
            errors: errors::NO_ERRORS,
        })
    }

    /// Handle for cancelling this sampler from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.active.clone())
    }

    /// Bounding box of the open vector index.
    pub fn bounding_box(&self) -> Extent {
        self.index.bbox()
    }

    /// Raster dimensions of the open vector index (zero for plain vector
    /// layers).
    pub fn dimensions(&self) -> (usize, usize) {
        self.index.dimensions()
    }

    /// The request-scoped raster path dictionary.
    pub fn file_dict(&self) -> &FileDict {
        &self.file_dict
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Sample every raster covering a point.
    ///
    /// `gps` is the point's GPS time in seconds (zero when absent); it
    /// drives the closest-time filter. Samples are returned in
    /// group-iteration order with flags attached from each group's
    /// companion raster.
    pub fn sample_point(&mut self, point: Point3, gps: i64) -> SampleSet {
        self.errors = errors::NO_ERRORS;
        let geometry = QueryGeometry::Point(point);

        let mut samples = Vec::new();
        if let Some(groups) = self.sample_geometry(&geometry, gps) {
            for (_, group) in groups.iter() {
                let flags = if self.config.sampling.flags_file {
                    self.group_flags(group)
                } else {
                    0
                };
                self.harvest_group_sample(group, flags, &mut samples);
            }
        }

        // Free unharvested results
        self.cache.clear_results();

        SampleSet {
            samples,
            errors: self.errors,
        }
    }

    /// Read the pixel rectangle of every raster overlapping an extent.
    pub fn subset_extent(&mut self, extent: Extent, gps: i64) -> SubsetSet {
        self.errors = errors::NO_ERRORS;
        let geometry = QueryGeometry::Extent(extent);

        let mut subsets = Vec::new();
        if let Some(groups) = self.sample_geometry(&geometry, gps) {
            for (_, group) in groups.iter() {
                self.harvest_group_subsets(group, &mut subsets);
            }
        }

        self.cache.clear_results();

        SubsetSet {
            subsets,
            errors: self.errors,
        }
    }

    /// Sample every raster covering each point of a dense array.
    ///
    /// Runs the unique-raster batch path: per-point group lists are built
    /// and filtered, rasters are deduplicated, and each physical raster is
    /// read once by a single batch reader thread iterating its points.
    pub fn sample_points(&mut self, points: &[PointInfo]) -> BatchSamples {
        self.errors = errors::NO_ERRORS;
        let mut stats = BatchStats::default();

        // Find raster groups for each point
        tracing::info!("Finding raster groups for {} points", points.len());
        let timer = Instant::now();
        let mut point_groups = Vec::with_capacity(points.len());
        for info in points {
            let gps = if self.config.sampling.use_poi_time {
                info.gps
            } else {
                0
            };
            let geometry = QueryGeometry::Point(info.point);

            if !self.index.contains(&geometry) {
                if let Err(e) =
                    self.index
                        .open(self.resolver.as_ref(), &geometry, &self.config.filters)
                {
                    tracing::warn!("{:#}", e);
                    self.errors |= errors::INDEX_FILE_ERROR;
                }
            }

            let mut groups = GroupOrdering::new();
            if !self.index.is_empty() {
                let options = GroupOptions::from_sampling(&self.config.sampling);
                self.finders
                    .find(self.index.features(), &geometry, &options, &mut groups);
                filters::apply(&mut groups, &self.config.filters, gps);
            }

            point_groups.push(PointGroups {
                point: info.point,
                index: info.index,
                groups,
            });
        }
        stats.find_secs = timer.elapsed().as_secs_f64();

        // Deduplicate rasters across all groups
        let timer = Instant::now();
        let unique = self.build_unique_rasters(&mut point_groups);
        stats.dedup_secs = timer.elapsed().as_secs_f64();
        stats.unique_rasters = unique.len();
        tracing::info!("{} unique rasters", unique.len());

        // Record, per unique raster, the distinct points referencing it
        let timer = Instant::now();
        stats.total_point_refs = assign_points(&point_groups, &unique);
        stats.assign_secs = timer.elapsed().as_secs_f64();

        // Sample each unique raster in batches of at most the pool size
        let timer = Instant::now();
        self.run_batches(&unique);
        stats.sample_secs = timer.elapsed().as_secs_f64();

        // Populate per-point sample lists
        let timer = Instant::now();
        let mut out = Vec::new();
        if self.is_active() {
            for pg in &point_groups {
                let mut list = Vec::new();
                for (_, group) in pg.groups.iter() {
                    let flags = if self.config.sampling.flags_file {
                        batch_group_flags(group, &unique, pg.index)
                    } else {
                        0
                    };
                    let (sample, ps_errors) = batch_group_sample(group, &unique, pg.index);
                    self.errors |= ps_errors;
                    if let Some(mut sample) = sample {
                        sample.flags = flags;
                        sample.errors |= ps_errors;
                        list.push(sample);
                    }
                }
                out.push(list);
            }
        }
        stats.assemble_secs = timer.elapsed().as_secs_f64();

        tracing::info!("Batch complete: {}", stats);

        BatchSamples {
            points: out,
            errors: self.errors,
            stats,
        }
    }

    /// Shared single-geometry path: open/reuse the index, fan out the
    /// finder pool, filter, update the cache, and dispatch readers.
    ///
    /// Returns the surviving group ordering, or `None` when the request
    /// produced nothing (with the error word updated for fatal cases).
    fn sample_geometry(&mut self, geometry: &QueryGeometry, gps: i64) -> Option<GroupOrdering> {
        // AOI requests always re-resolve; point requests reuse the open
        // index while they stay inside its bbox
        if geometry.is_extent() || !self.index.contains(geometry) {
            if let Err(e) = self
                .index
                .open(self.resolver.as_ref(), geometry, &self.config.filters)
            {
                tracing::warn!("{:#}", e);
                self.errors |= errors::INDEX_FILE_ERROR;
                return None;
            }
        }

        let mut groups = GroupOrdering::new();
        let options = GroupOptions::from_sampling(&self.config.sampling);
        self.finders
            .find(self.index.features(), geometry, &options, &mut groups);
        if groups.is_empty() {
            return None;
        }

        filters::apply(&mut groups, &self.config.filters, gps);
        if groups.is_empty() {
            return None;
        }

        let enabled = self.update_cache(&groups)?;

        if self.readers.ensure(enabled.len()).is_err() {
            tracing::error!("Failed to create reader threads, needed: {}", enabled.len());
            self.errors |= errors::RESOURCE_LIMIT_ERROR;
            return None;
        }

        let task = match geometry {
            QueryGeometry::Point(p) => ReadTask::Sample(*p),
            QueryGeometry::Extent(e) => ReadTask::Subset(*e),
        };
        self.readers.dispatch(&enabled, task);

        Some(groups)
    }

    /// Re-mark the handle cache for this request's groups and collect the
    /// enabled entries for dispatch.
    fn update_cache(&mut self, groups: &GroupOrdering) -> Option<Vec<SharedEntry>> {
        self.cache.disable_all();

        for (_, group) in groups.iter() {
            for desc in &group.descriptors {
                let file_id = self.file_dict.add(&desc.path);
                let sampling = &self.config.sampling;
                let crs_override = self.crs_override.clone();
                let transforms = self.transforms.clone();
                let gps_time = group.gps_time;
                let path = desc.path.clone();
                let is_elevation = desc.is_elevation;
                self.cache.enable_or_insert(&desc.path, move || {
                    RasterHandle::new(
                        sampling,
                        path,
                        gps_time,
                        file_id,
                        is_elevation,
                        crs_override,
                        transforms,
                    )
                });
            }
        }

        self.cache.prune_disabled();

        let enabled = self.cache.enabled_entries();
        if enabled.len() > self.config.limits.max_reader_threads {
            tracing::error!(
                "Too many rasters to read: {}, max allowed: {}",
                enabled.len(),
                self.config.limits.max_reader_threads
            );
            self.errors |= errors::THREADS_LIMIT_ERROR;
            return None;
        }

        Some(enabled)
    }

    /// Move the group's value sample out of the cache, attaching flags.
    ///
    /// A group contributes at most one value sample; its handle's error
    /// word is folded into the request word.
    fn harvest_group_sample(&mut self, group: &RasterGroup, flags: u32, out: &mut Vec<Sample>) {
        let Some(desc) = group.value() else {
            return;
        };
        let Some(entry) = self.cache.peek(&desc.path) else {
            return;
        };

        let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        let handle_errors = entry.handle.error();
        if let Some(mut sample) = entry.sample.take() {
            sample.flags = flags;
            sample.errors |= handle_errors;
            out.push(sample);
        }
        self.errors |= handle_errors;
    }

    /// Flags value for a group, read from its companion raster's sample
    /// without consuming it.
    fn group_flags(&self, group: &RasterGroup) -> u32 {
        let Some(desc) = group.flags() else {
            return 0;
        };
        let Some(entry) = self.cache.peek(&desc.path) else {
            return 0;
        };

        let entry = entry.lock().unwrap_or_else(|e| e.into_inner());
        entry.sample.as_ref().map(|s| s.value as u32).unwrap_or(0)
    }

    /// Move every subset of the group out of the cache.
    fn harvest_group_subsets(&mut self, group: &RasterGroup, out: &mut Vec<RasterSubset>) {
        for desc in &group.descriptors {
            let Some(entry) = self.cache.peek(&desc.path) else {
                continue;
            };

            let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
            let handle_errors = entry.handle.error();
            if let Some(mut subset) = entry.subset.take() {
                subset.errors |= handle_errors;
                out.push(subset);
            }
            self.errors |= handle_errors;
        }
    }

    /// Deduplicate every raster referenced across all per-point groups.
    /// Distinct file paths map to distinct unique rasters; each descriptor
    /// records the index of its raster.
    fn build_unique_rasters(&mut self, point_groups: &mut [PointGroups]) -> Vec<Arc<UniqueRaster>> {
        let mut unique: Vec<Arc<UniqueRaster>> = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();

        for pg in point_groups.iter_mut() {
            for group in pg.groups.iter_mut() {
                let gps_time = group.gps_time;
                for desc in &mut group.descriptors {
                    let idx = match by_path.get(&desc.path) {
                        Some(idx) => *idx,
                        None => {
                            let file_id = self.file_dict.add(&desc.path);
                            unique.push(Arc::new(UniqueRaster {
                                path: desc.path.clone(),
                                is_elevation: desc.is_elevation,
                                gps_time,
                                file_id,
                                point_samples: Mutex::new(Vec::new()),
                            }));
                            by_path.insert(desc.path.clone(), unique.len() - 1);
                            unique.len() - 1
                        }
                    };
                    desc.unique = Some(idx);
                }
            }
        }

        unique
    }

    /// Run batch readers over the unique rasters, checking the active flag
    /// at every batch boundary.
    fn run_batches(&mut self, unique: &[Arc<UniqueRaster>]) {
        if unique.is_empty() {
            return;
        }

        let threads = unique.len().min(self.config.limits.max_reader_threads);
        let sys_timeout = Duration::from_millis(self.config.limits.sys_timeout_ms);
        let pool = match BatchReaderPool::new(
            threads,
            self.config.sampling.clone(),
            self.crs_override.clone(),
            self.transforms.clone(),
            sys_timeout,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("Failed to create batch reader threads: {:#}", e);
                self.errors |= errors::RESOURCE_LIMIT_ERROR;
                return;
            }
        };

        let mut current = 0;
        let mut batch_no = 0;
        while current < unique.len() {
            if !self.is_active() {
                tracing::warn!("Sampling stopped");
                break;
            }

            let end = (current + pool.len()).min(unique.len());
            tracing::info!("Sampling batch {} with {} rasters", batch_no, end - current);
            pool.run_batch(&unique[current..end]);
            current = end;
            batch_no += 1;
        }
    }
}

/// Record, per unique raster, one entry for every distinct point index
/// referencing it. Returns the total reference count.
fn assign_points(point_groups: &[PointGroups], unique: &[Arc<UniqueRaster>]) -> usize {
    let mut total = 0;
    for pg in point_groups {
        let mut seen: Vec<usize> = Vec::new();
        for (_, group) in pg.groups.iter() {
            for desc in &group.descriptors {
                if let Some(idx) = desc.unique {
                    if !seen.contains(&idx) {
                        seen.push(idx);
                    }
                }
            }
        }

        for idx in seen {
            if let Some(raster) = unique.get(idx) {
                raster
                    .point_samples
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(PointSample {
                        point: pg.point,
                        point_index: pg.index,
                        sample: None,
                        errors: errors::NO_ERRORS,
                    });
                total += 1;
            }
        }
    }
    total
}

/// Copy the group's value sample for one point out of its unique raster.
///
/// The sample is copied, not moved: a unique raster may be referenced by
/// the groups of many points and each output list owns its samples.
fn batch_group_sample(
    group: &RasterGroup,
    unique: &[Arc<UniqueRaster>],
    point_index: usize,
) -> (Option<Sample>, u32) {
    let Some(desc) = group.value() else {
        return (None, errors::NO_ERRORS);
    };
    let Some(raster) = desc.unique.and_then(|i| unique.get(i)) else {
        return (None, errors::NO_ERRORS);
    };

    let point_samples = raster
        .point_samples
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    for ps in point_samples.iter() {
        if ps.point_index == point_index {
            return (ps.sample.clone(), ps.errors);
        }
    }
    (None, errors::NO_ERRORS)
}

/// Flags value for a group and point, read from the flags raster's unique
/// raster.
fn batch_group_flags(group: &RasterGroup, unique: &[Arc<UniqueRaster>], point_index: usize) -> u32 {
    let Some(desc) = group.flags() else {
        return 0;
    };
    let Some(raster) = desc.unique.and_then(|i| unique.get(i)) else {
        return 0;
    };

    let point_samples = raster
        .point_samples
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    for ps in point_samples.iter() {
        if ps.point_index == point_index {
            return ps.sample.as_ref().map(|s| s.value as u32).unwrap_or(0);
        }
    }
    0
}
