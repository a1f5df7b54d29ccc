//! Raster groups and their per-request ordering.
//!
//! The finder pool turns every intersecting index feature into a raster
//! group: the value raster plus its optional companions, stamped with the
//! feature's time. Groups are collected into a [`GroupOrdering`], an
//! insertion-ordered mapping that drives deterministic result assembly.

use chrono::{DateTime, Utc};

/// Role of a raster within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterTag {
    /// The primary measurement raster
    Value,
    /// A companion quality/mask raster
    Flags,
}

impl RasterTag {
    /// The tag's conventional string form in index files.
    pub fn as_str(&self) -> &'static str {
        match self {
            RasterTag::Value => "Value",
            RasterTag::Flags => "Fmask",
        }
    }
}

impl std::fmt::Display for RasterTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raster referenced by a group.
#[derive(Debug, Clone)]
pub struct RasterDescriptor {
    /// File path of the raster
    pub path: String,

    /// Role within the group
    pub tag: RasterTag,

    /// Whether sampled values are elevations
    pub is_elevation: bool,

    /// Index into the request's unique raster table (batch requests only)
    pub unique: Option<usize>,
}

impl RasterDescriptor {
    pub fn new(path: String, tag: RasterTag, is_elevation: bool) -> Self {
        Self {
            path,
            tag,
            is_elevation,
            unique: None,
        }
    }
}

/// A set of raster descriptors produced together by the index, sharing a
/// timestamp.
///
/// A group holds at most one `Value` and at most one `Flags` descriptor as
/// far as the generic sampler is concerned; additional tags are
/// dataset-specific and ignored here.
#[derive(Debug, Clone)]
pub struct RasterGroup {
    /// Group identifier (feature-derived, unique within a request)
    pub id: String,

    /// Rasters in this group
    pub descriptors: Vec<RasterDescriptor>,

    /// Group calendar date (UTC)
    pub date: DateTime<Utc>,

    /// Group time in GPS seconds
    pub gps_time: i64,
}

impl RasterGroup {
    /// The group's value descriptor, if any.
    pub fn value(&self) -> Option<&RasterDescriptor> {
        self.descriptors.iter().find(|d| d.tag == RasterTag::Value)
    }

    /// The group's flags descriptor, if any.
    pub fn flags(&self) -> Option<&RasterDescriptor> {
        self.descriptors.iter().find(|d| d.tag == RasterTag::Flags)
    }
}

/// Insertion-ordered mapping from group key to raster group.
///
/// Keys are assigned densely in insertion order, which for a request equals
/// finder partition order. Iteration follows insertion order; removal is by
/// key. There is no reverse iteration.
#[derive(Debug, Default)]
pub struct GroupOrdering {
    entries: Vec<(u64, RasterGroup)>,
    next_key: u64,
}

impl GroupOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group, returning its key.
    pub fn push(&mut self, group: RasterGroup) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.push((key, group));
        key
    }

    /// Remove the group with the given key. Returns whether it was present.
    pub fn remove(&mut self, key: u64) -> bool {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Retain only groups for which the predicate holds.
    pub fn retain<F: FnMut(&RasterGroup) -> bool>(&mut self, mut f: F) {
        self.entries.retain(|(_, g)| f(g));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(key, group)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &RasterGroup)> {
        self.entries.iter().map(|(k, g)| (*k, g))
    }

    /// Iterate groups mutably in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RasterGroup> {
        self.entries.iter_mut().map(|(_, g)| g)
    }
}
