//! Batch reader pool: many points, few unique rasters.
//!
//! Batch requests deduplicate every raster referenced across all per-point
//! groups into unique rasters, each recording the distinct points that
//! reference it. One batch reader thread owns one unique raster at a time:
//! it opens the dataset once and samples the raster's whole point list in a
//! single pass. GDAL's block cache is disabled in these threads; streaming
//! disjoint points through it just thrashes.

use crate::config::SamplingConfig;
use crate::crs::TransformCache;
use crate::geometry::Point3;
use crate::io::{CrsOverride, RasterHandle, Sample};
use anyhow::{Context, Result};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// One point's slot within a unique raster.
#[derive(Debug)]
pub struct PointSample {
    pub point: Point3,
    pub point_index: usize,
    pub sample: Option<Sample>,
    pub errors: u32,
}

/// The deduplicated representation of a physical raster within one batch
/// request.
///
/// `point_samples` holds one entry per distinct point index referencing
/// this raster; only the batch reader thread assigned to the raster writes
/// it, and the controller reads it after the thread's completion signal.
pub struct UniqueRaster {
    pub path: String,
    pub is_elevation: bool,
    pub gps_time: i64,
    pub file_id: u64,
    pub point_samples: Mutex<Vec<PointSample>>,
}

enum SlotState {
    Idle,
    Pending(Arc<UniqueRaster>),
    Done,
}

struct Slot {
    state: SlotState,
    run: bool,
}

type Shared = Arc<(Mutex<Slot>, Condvar, Condvar)>;

struct BatchReader {
    shared: Shared,
    thread: Option<JoinHandle<()>>,
}

/// Pool of batch reader threads, one unique raster per thread per batch.
pub struct BatchReaderPool {
    readers: Vec<BatchReader>,
    sys_timeout: Duration,
}

impl BatchReaderPool {
    pub fn new(
        threads: usize,
        sampling: SamplingConfig,
        crs_override: Option<CrsOverride>,
        transforms: Arc<TransformCache>,
        sys_timeout: Duration,
    ) -> Result<Self> {
        let sampling = Arc::new(sampling);

        let mut readers = Vec::with_capacity(threads);
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
            let worker_sampling = sampling.clone();
            let worker_override = crs_override.clone();
            let worker_transforms = transforms.clone();
            let thread = std::thread::Builder::new()
                .name(format!("batch-reader-{i}"))
                .spawn(move || {
                    batch_reader_thread(
                        worker_shared,
                        worker_sampling,
                        worker_override,
                        worker_transforms,
                        sys_timeout,
                    )
                })
                .context("Failed to create batch reader thread")?;
            readers.push(BatchReader {
                shared,
                thread: Some(thread),
            });
        }

        tracing::info!("Created {} batch reader threads", readers.len());
        Ok(Self {
            readers,
            sys_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// Sample one batch of rasters (at most the pool size) and wait for all
    /// of them to complete.
    pub fn run_batch(&self, rasters: &[Arc<UniqueRaster>]) {
        let count = rasters.len().min(self.readers.len());

        for (reader, raster) in self.readers.iter().zip(rasters.iter()).take(count) {
            let (lock, task_ready, _) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.state = SlotState::Pending(raster.clone());
            task_ready.notify_one();
        }

        for reader in self.readers.iter().take(count) {
            let (lock, _, task_done) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Done => break,
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

impl Drop for BatchReaderPool {
    fn drop(&mut self) {
        for reader in &self.readers {
            let (lock, task_ready, _) = &*reader.shared;
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            slot.run = false;
            task_ready.notify_one();
        }
        for reader in &mut self.readers {
            if let Some(thread) = reader.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn batch_reader_thread(
    shared: Shared,
    sampling: Arc<SamplingConfig>,
    crs_override: Option<CrsOverride>,
    transforms: Arc<TransformCache>,
    sys_timeout: Duration,
) {
    let (lock, task_ready, task_done) = &*shared;

    // Block cache off while batch readers stream disjoint points
    let _ = gdal::config::set_config_option("GDAL_CACHEMAX", "0");

    loop {
        let raster = {
            let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if !slot.run {
                    return;
                }
                match std::mem::replace(&mut slot.state, SlotState::Idle) {
                    SlotState::Pending(raster) => break raster,
                    other => slot.state = other,
                }
                slot = task_ready
                    .wait_timeout(slot, sys_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        };

        {
            let mut handle = RasterHandle::new(
                &sampling,
                raster.path.clone(),
                raster.gps_time,
                raster.file_id,
                raster.is_elevation,
                crs_override.clone(),
                transforms.clone(),
            );

            let mut point_samples = raster
                .point_samples
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for ps in point_samples.iter_mut() {
                ps.sample = handle.sample(&ps.point);
                ps.errors |= handle.error();
            }
        }

        let mut slot = lock.lock().unwrap_or_else(|e| e.into_inner());
        slot.state = SlotState::Done;
        task_done.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors;
    use crate::testutil::create_test_raster;

    fn make_pool(threads: usize) -> BatchReaderPool {
        let sampling = SamplingConfig::default();
        let transforms = Arc::new(TransformCache::new(&sampling.input_crs));
        BatchReaderPool::new(threads, sampling, None, transforms, Duration::from_millis(100))
            .unwrap()
    }

    fn make_unique(path: &str, file_id: u64, points: &[(f64, f64, usize)]) -> Arc<UniqueRaster> {
        Arc::new(UniqueRaster {
            path: path.to_string(),
            is_elevation: true,
            gps_time: 1000,
            file_id,
            point_samples: Mutex::new(
                points
                    .iter()
                    .map(|(x, y, idx)| PointSample {
                        point: Point3::new(*x, *y, 0.0),
                        point_index: *idx,
                        sample: None,
                        errors: 0,
                    })
                    .collect(),
            ),
        })
    }

    #[test]
    fn test_batch_samples_all_points_in_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut rasters = Vec::new();
        for i in 0..2 {
            let path = dir.path().join(format!("r{i}.tif"));
            create_test_raster(
                &path,
                10,
                10,
                [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                vec![(i + 1) as f64 * 100.0; 100],
                None,
            );
            rasters.push(make_unique(
                &path.to_string_lossy(),
                i as u64,
                &[(1.5, 1.5, 0), (2.5, 2.5, 1), (3.5, 3.5, 2)],
            ));
        }

        let pool = make_pool(2);
        pool.run_batch(&rasters);

        for (i, raster) in rasters.iter().enumerate() {
            let point_samples = raster.point_samples.lock().unwrap();
            assert_eq!(point_samples.len(), 3);
            for ps in point_samples.iter() {
                let sample = ps.sample.as_ref().expect("sample recorded");
                assert_eq!(sample.value, (i + 1) as f64 * 100.0);
                assert_eq!(sample.file_id, i as u64);
                assert_eq!(ps.errors, errors::NO_ERRORS);
            }
        }
    }

    #[test]
    fn test_batch_records_per_point_errors() {
        let rasters = vec![make_unique("/nonexistent/r.tif", 0, &[(1.0, 1.0, 0)])];

        let pool = make_pool(1);
        pool.run_batch(&rasters);

        let point_samples = rasters[0].point_samples.lock().unwrap();
        assert!(point_samples[0].sample.is_none());
        assert_eq!(
            point_samples[0].errors & errors::READ_ERROR,
            errors::READ_ERROR
        );
    }

    #[test]
    fn test_multiple_batches_reuse_threads() {
        let dir = tempfile::tempdir().unwrap();
        let mut rasters = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("r{i}.tif"));
            create_test_raster(
                &path,
                10,
                10,
                [0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                vec![i as f64; 100],
                None,
            );
            rasters.push(make_unique(&path.to_string_lossy(), i as u64, &[(5.0, 5.0, 0)]));
        }

        // Pool of 2 threads, 4 rasters: two batches
        let pool = make_pool(2);

        let mut current = 0;
        while current < rasters.len() {
            let end = (current + pool.len()).min(rasters.len());
            pool.run_batch(&rasters[current..end]);
            current = end;
        }

        for (i, raster) in rasters.iter().enumerate() {
            let point_samples = raster.point_samples.lock().unwrap();
            assert_eq!(
                point_samples[0].sample.as_ref().map(|s| s.value),
                Some(i as f64)
            );
        }
    }
}
