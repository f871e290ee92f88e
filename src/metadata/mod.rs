//! Shard locations and per-metric interval metadata
//!
//! The timeline of every metric is partitioned into half-open bins of
//! width `shard_interval`; each bin is one location placed on exactly one
//! node. The registry owns the local cache and the persisted copy.

mod registry;

pub use registry::MetadataRegistry;

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Inclusive time range of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// The whole time axis.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// A reversed range holds nothing.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.end && self.end >= other.start
    }

    /// Intersection of two ranges; may come out reversed (empty).
    pub fn intersect(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(self.start.max(other.start), self.end.min(other.end))
    }

    /// Convex hull of two ranges.
    pub fn hull(&self, other: &TimeRange) -> TimeRange {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        TimeRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

impl From<Range<i64>> for TimeRange {
    fn from(range: Range<i64>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// One half-open time bin `[lower_ts, upper_ts)` of one metric, owned by
/// one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub metric: String,
    pub node_id: String,
    pub lower_ts: i64,
    pub upper_ts: i64,
}

impl Location {
    /// Bin width in milliseconds.
    pub fn shard_interval(&self) -> i64 {
        self.upper_ts - self.lower_ts
    }

    /// Position of the bin on the time axis.
    pub fn bin_index(&self) -> i64 {
        self.lower_ts.div_euclid(self.shard_interval())
    }

    /// Half-open containment: a timestamp on the upper boundary belongs to
    /// the next bin.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.lower_ts && timestamp < self.upper_ts
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        !range.is_empty() && self.lower_ts <= range.end && self.upper_ts > range.start
    }
}

/// Per-metric shard interval; set once, then frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricInfo {
    pub metric: String,
    pub shard_interval_ms: u64,
}
