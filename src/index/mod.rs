//! Structured record indexes, one per shard
//!
//! `ShardIndex` stores the typed documents of one time bin; the
//! `ShardDirectory` opens indexes on demand and caches them per
//! (metric, bin) until the metric is dropped.

mod predicate;
mod shard;

pub use predicate::{analyze, IndexPredicate, RangeBound};
pub use shard::{compare_records, QueryOutcome, ShardIndex, ShardWriter};

use crate::error::Result;
use crate::metadata::Location;
use dashmap::DashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// On-demand cache of the shard indexes stored on this node.
#[derive(Debug)]
pub struct ShardDirectory {
    base: PathBuf,
    shards: DashMap<(String, i64), Arc<ShardIndex>>,
}

impl ShardDirectory {
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            shards: DashMap::new(),
        })
    }

    /// The shard index backing a location, opened on first use.
    pub fn get_or_open(&self, location: &Location) -> Result<Arc<ShardIndex>> {
        let key = (location.metric.clone(), location.bin_index());
        if let Some(shard) = self.shards.get(&key) {
            return Ok(shard.clone());
        }
        let dir = self
            .base
            .join(&location.metric)
            .join(location.bin_index().to_string());
        let shard = ShardIndex::open(dir, &location.metric)?;
        // a concurrent open of the same bin settles on the first entry
        let entry = self.shards.entry(key).or_insert(shard);
        Ok(entry.clone())
    }

    /// Close and delete every shard of a metric. Idempotent.
    pub fn remove_metric(&self, metric: &str) -> Result<()> {
        self.shards.retain(|(m, _), _| m != metric);
        let dir = self.base.join(metric);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(metric, "shards removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of shard indexes currently open.
    pub fn open_count(&self) -> usize {
        self.shards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(metric: &str, lower: i64, upper: i64) -> Location {
        Location {
            metric: metric.to_string(),
            node_id: "node-1".to_string(),
            lower_ts: lower,
            upper_ts: upper,
        }
    }

    #[test]
    fn get_or_open_caches_per_bin() {
        let dir = tempfile::tempdir().unwrap();
        let directory = ShardDirectory::open(dir.path()).unwrap();

        let a = directory.get_or_open(&location("people", 0, 100)).unwrap();
        let b = directory.get_or_open(&location("people", 0, 100)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        directory.get_or_open(&location("people", 100, 200)).unwrap();
        assert_eq!(directory.open_count(), 2);
    }

    #[test]
    fn remove_metric_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let directory = ShardDirectory::open(dir.path()).unwrap();
        directory.get_or_open(&location("people", 0, 100)).unwrap();

        directory.remove_metric("people").unwrap();
        assert_eq!(directory.open_count(), 0);
        directory.remove_metric("people").unwrap();
    }
}
