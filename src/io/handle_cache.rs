//! Bounded cache of open raster handles.
//!
//! The cache keys handles by raster path and survives across requests of
//! one sampler, so a point dense track re-samples the same strip DEMs
//! without reopening them. Before every dispatch all entries are disabled;
//! entries referenced by the request's surviving groups are re-enabled (or
//! inserted), and disabled entries are pruned when the cache grows past its
//! bound. Each entry carries the slots its reader thread fills.

use crate::io::raster::{RasterHandle, RasterSubset, Sample};
use lru::LruCache;
use std::sync::{Arc, Mutex};

/// A cached raster handle with its latest results.
pub struct CacheEntry {
    pub handle: RasterHandle,

    /// Result slot filled by a point-sampling reader
    pub sample: Option<Sample>,

    /// Result slot filled by a subsetting reader
    pub subset: Option<RasterSubset>,

    /// Whether this entry participates in the current request
    pub enabled: bool,
}

/// Shared form handed to reader threads for the duration of a dispatch.
pub type SharedEntry = Arc<Mutex<CacheEntry>>;

/// Path-keyed cache of raster handles with enable marking.
pub struct HandleCache {
    cache: LruCache<String, SharedEntry>,
    max_size: usize,
}

impl HandleCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: LruCache::unbounded(),
            max_size,
        }
    }

    /// Mark every entry as not participating in the current request.
    pub fn disable_all(&mut self) {
        for (_, entry) in self.cache.iter() {
            entry.lock().unwrap_or_else(|e| e.into_inner()).enabled = false;
        }
    }

    /// Enable the entry for `path`, creating it with `make` when absent.
    pub fn enable_or_insert<F: FnOnce() -> RasterHandle>(&mut self, path: &str, make: F) {
        if let Some(entry) = self.cache.get(path) {
            entry.lock().unwrap_or_else(|e| e.into_inner()).enabled = true;
            return;
        }

        let entry = Arc::new(Mutex::new(CacheEntry {
            handle: make(),
            sample: None,
            subset: None,
            enabled: true,
        }));
        self.cache.put(path.to_string(), entry);
    }

    /// Remove disabled entries once the cache exceeds its bound.
    pub fn prune_disabled(&mut self) {
        if self.cache.len() <= self.max_size {
            return;
        }

        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, entry)| !entry.lock().unwrap_or_else(|e| e.into_inner()).enabled)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &stale {
            self.cache.pop(path);
        }

        if !stale.is_empty() {
            tracing::debug!("Pruned {} disabled cache entries", stale.len());
        }
    }

    /// All enabled entries, for reader dispatch.
    pub fn enabled_entries(&self) -> Vec<SharedEntry> {
        self.cache
            .iter()
            .filter(|(_, entry)| entry.lock().unwrap_or_else(|e| e.into_inner()).enabled)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.cache
            .iter()
            .filter(|(_, entry)| entry.lock().unwrap_or_else(|e| e.into_inner()).enabled)
            .count()
    }

    /// Look up an entry without changing recency (used during harvest).
    pub fn peek(&self, path: &str) -> Option<&SharedEntry> {
        self.cache.peek(path)
    }

    /// Drop any results not harvested by the request.
    pub fn clear_results(&mut self) {
        for (_, entry) in self.cache.iter() {
            let mut entry = entry.lock().unwrap_or_else(|e| e.into_inner());
            entry.sample = None;
            entry.subset = None;
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
