//! Finder pool: which index features cover a request geometry.
//!
//! A fixed pool of long-lived threads is created with the sampler. Per
//! request the feature list is range-partitioned across the pool; each
//! finder walks its range, tests every feature against the request
//! geometry, and builds raster groups into its private buffer. The
//! controller merges the buffers in partition order, which makes the group
//! ordering deterministic. Finders sleep on their condition variable
//! between requests and are joined exactly once when the pool drops.

use crate::config::SamplingConfig;
use crate::geometry::QueryGeometry;
use crate::index::{GroupOrdering, IndexFeature, RasterDescriptor, RasterGroup, RasterTag};
use anyhow::{Context, Result};
use geo::Intersects;
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Suffix pair deriving a flags raster path from a value raster path.
const VALUE_SUFFIX: &str = "_dem.tif";
const FLAGS_SUFFIX: &str = "_bitmask.tif";

/// Options controlling group construction from index features.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub flags_file: bool,
    pub force_not_elevation: bool,
}

impl GroupOptions {
    pub fn from_sampling(sampling: &SamplingConfig) -> Self {
        Self {
            flags_file: sampling.flags_file,
            force_not_elevation: sampling.force_not_elevation,
        }
    }
}

struct FindTask {
    features: Arc<Vec<IndexFeature>>,
    geometry: geo::Geometry<f64>,
    range: Range<usize>,
    options: GroupOptions,
}

enum SlotState {
    Idle,
    Pending(FindTask),
    Done(Vec<RasterGroup>),
}

struct Slot {
    state: SlotState,
    run: bool,
}

type Shared = Arc<(Mutex<Slot>, Condvar, Condvar)>;

struct Finder {
    shared: Shared,
    thread: Option<JoinHandle<()>>,
}

/// Fixed pool of finder threads.
pub struct FinderPool {
    finders: Vec<Finder>,
    min_features_per_thread: usize,
    sys_timeout: Duration,
}

impl FinderPool {
    pub fn new(
        threads: usize,
        min_features_per_thread: usize,
        sys_timeout: Duration,
    ) -> Result<Self> {
        let mut finders = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared: Shared = Arc::new((
                Mutex::new(Slot {
                    state: SlotState::Idle,
                    run: true,
                }),
                Condvar::new(),
                Condvar::new(),
            ));
            let worker_shared = shared.clone();
            let thread = std::thread::Builder::new()
                .name(format!("finder-{i}"))
                .spawn(move || finder_thread(worker_shared, sys_timeout))
                .context("Failed to create finder thread")?;
            finders.push(Finder {
                shared,
                thread: Some(thread),
            });
        }

        Ok(Self {
            finders,
            min_features_per_thread,
            sys_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.finders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.is_empty()
    }

    /// Range-partition `features` across the pool.
    ///
    /// Below the per-thread minimum one finder takes everything; above it at
    /// least two share the work, with the division remainder spread one
    /// feature per partition from the front.
    fn partition(&self, features: usize) -> Vec<Range<usize>> {
        let min = self.min_features_per_thread;
        if features <= min {
            return vec![0..features];
        }

        let mut count = (features / min).min(self.finders.len());
        if count == 1 {
            count = 2;
        }
        let count = count.min(self.finders.len()).max(1);

        let per_thread = features / count;
        let mut remainder = features % count;

        let mut ranges = Vec::with_capacity(count);
        let mut start = 0;
        for _ in 0..count {
            let extra = if remainder > 0 { 1 } else { 0 };
            remainder = remainder.saturating_sub(1);
            let end = start + per_thread + extra;
            ranges.push(start..end);
            start = end;
        }
        ranges
    }

    /// Find every feature intersecting `geometry` and merge the resulting
    /// groups into `out` in partition order.
    pub fn find(
        &self,
        features: &Arc<Vec<IndexFeature>>,
        geometry: &QueryGeometry,
        options: &GroupOptions,
        out: &mut GroupOrdering,
    ) {
        let ranges = self.partition(features.len());
        let geometry = geometry.to_geo();

        for (finder, range) in self.finders.iter().zip(&ranges) {
            let (lock, task_ready, _) = &*finder.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.state = SlotState::Pending(FindTask {
                features: features.clone(),
                geometry: geometry.clone(),
                range: range.clone(),
                options: options.clone(),
            });
            task_ready.notify_one();
        }

        // Await completion and merge per-thread buffers in partition order
        for finder in self.finders.iter().take(ranges.len()) {
            let (lock, _, task_done) = &*finder.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Done(groups) => {
                        for group in groups {
                            out.push(group);
                        }
                        break;
                    }
                    other => slot.state = other,
                }
                slot = task_done
                    .wait_timeout(slot, self.sys_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }
    }
}

impl Drop for FinderPool {
    fn drop(&mut self) {
        for finder in &self.finders {
            let (lock, task_ready, _) = &*finder.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.run = false;
            task_ready.notify_one();
        }
        for finder in &mut self.finders {
            if let Some(thread) = finder.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn finder_thread(shared: Shared, sys_timeout: Duration) {
    let (lock, task_ready, task_done) = &*shared;

    loop {
        let task = {
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if !slot.run {
                    return;
                }
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Pending(task) => break task,
                    other => slot.state = other,
                }
                slot = task_ready
                    .wait_timeout(slot, sys_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        };

        let groups = find_groups(&task);

        let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
        slot.state = SlotState::Done(groups);
        task_done.notify_one();
    }
}

fn find_groups(task: &FindTask) -> Vec<RasterGroup> {
    let mut groups = Vec::new();
    for idx in task.range.clone() {
        let feature = &task.features[idx];
        if !feature.geometry.intersects(&task.geometry) {
            continue;
        }
        groups.push(build_group(feature, idx, &task.options));
    }
    groups
}

/// Build a raster group from an intersecting index feature.
pub(crate) fn build_group(
    feature: &IndexFeature,
    feature_idx: usize,
    options: &GroupOptions,
) -> RasterGroup {
    let mut descriptors = vec![RasterDescriptor::new(
        feature.raster_path.clone(),
        RasterTag::Value,
        !options.force_not_elevation,
    )];

    if options.flags_file {
        let flags_path = feature
            .flags_path
            .clone()
            .or_else(|| derive_flags_path(&feature.raster_path));
        if let Some(path) = flags_path {
            descriptors.push(RasterDescriptor::new(path, RasterTag::Flags, false));
        }
    }

    RasterGroup {
        id: feature_idx.to_string(),
        descriptors,
        date: feature.date,
        gps_time: feature.gps_time,
    }
}

/// Derive the flags raster path from a value raster path, or `None` when
/// the naming convention does not apply.
fn derive_flags_path(path: &str) -> Option<String> {
    let pos = path.rfind(VALUE_SUFFIX)?;
    if pos + VALUE_SUFFIX.len() != path.len() {
        return None;
    }
    Some(format!("{}{}", &path[..pos], FLAGS_SUFFIX))
}
