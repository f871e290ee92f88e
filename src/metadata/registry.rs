//! Per-namespace location and metric-info registry
//!
//! Locations are created lazily when the first record of a bin is
//! admitted and never mutated afterwards. Placement is a pure function of
//! `(metric, bin_index)` and the sorted membership snapshot, so any node
//! computes the same owner without coordination; concurrent creates of
//! the same bin converge on the minimum node id.

use super::{Location, MetricInfo, TimeRange};
use crate::cluster::{ClusterMediator, ClusterView, MetadataEvent};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const LOCATIONS_FILE: &str = "locations.json";
const METRIC_INFO_FILE: &str = "metric_info.json";

/// Location and metric-info metadata of one (db, namespace).
#[derive(Debug)]
pub struct MetadataRegistry {
    db: String,
    namespace: String,
    dir: PathBuf,
    default_interval_ms: u64,
    cluster: Arc<ClusterView>,
    mediator: ClusterMediator,
    metric_info: DashMap<String, u64>,
    locations: DashMap<(String, i64), Location>,
}

impl MetadataRegistry {
    pub fn open(
        dir: impl Into<PathBuf>,
        db: impl Into<String>,
        namespace: impl Into<String>,
        default_interval_ms: u64,
        cluster: Arc<ClusterView>,
        mediator: ClusterMediator,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let registry = Self {
            db: db.into(),
            namespace: namespace.into(),
            dir,
            default_interval_ms,
            cluster,
            mediator,
            metric_info: DashMap::new(),
            locations: DashMap::new(),
        };
        registry.load()?;
        Ok(registry)
    }

    fn load(&self) -> Result<()> {
        let info_path = self.dir.join(METRIC_INFO_FILE);
        if info_path.exists() {
            let raw = fs::read_to_string(&info_path)?;
            let infos: BTreeMap<String, u64> = serde_json::from_str(&raw)?;
            for (metric, interval) in infos {
                self.metric_info.insert(metric, interval);
            }
        }
        let locations_path = self.dir.join(LOCATIONS_FILE);
        if locations_path.exists() {
            let raw = fs::read_to_string(&locations_path)?;
            let locations: Vec<Location> = serde_json::from_str(&raw)?;
            for location in locations {
                self.locations
                    .insert((location.metric.clone(), location.bin_index()), location);
            }
        }
        debug!(
            db = %self.db,
            namespace = %self.namespace,
            locations = self.locations.len(),
            metrics = self.metric_info.len(),
            "metadata registry opened"
        );
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let infos: BTreeMap<String, u64> = self
            .metric_info
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        write_atomic(&self.dir.join(METRIC_INFO_FILE), &serde_json::to_vec_pretty(&infos)?)?;

        let mut locations: Vec<Location> =
            self.locations.iter().map(|entry| entry.value().clone()).collect();
        locations.sort_by(|a, b| (&a.metric, a.lower_ts).cmp(&(&b.metric, b.lower_ts)));
        write_atomic(
            &self.dir.join(LOCATIONS_FILE),
            &serde_json::to_vec_pretty(&locations)?,
        )?;
        Ok(())
    }

    /// Set the shard interval of a metric. Append-only: once set, shard
    /// boundaries are frozen and a different interval is rejected.
    pub fn put_metric_info(&self, metric: &str, shard_interval_ms: u64) -> Result<MetricInfo> {
        if shard_interval_ms == 0 {
            return Err(Error::Config("shard interval must be positive".into()));
        }
        if let Some(existing) = self.metric_info.get(metric) {
            let existing = *existing;
            if existing != shard_interval_ms {
                return Err(Error::IntervalFrozen {
                    metric: metric.to_string(),
                    interval_ms: existing,
                });
            }
            return Ok(MetricInfo {
                metric: metric.to_string(),
                shard_interval_ms: existing,
            });
        }

        self.metric_info.insert(metric.to_string(), shard_interval_ms);
        self.persist()?;
        info!(metric, shard_interval_ms, "metric info set");
        self.mediator.publish(MetadataEvent::MetricInfoPut {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            metric: metric.to_string(),
            shard_interval_ms,
        });
        Ok(MetricInfo {
            metric: metric.to_string(),
            shard_interval_ms,
        })
    }

    /// Bin width for a metric, falling back to the configured default.
    pub fn shard_interval(&self, metric: &str) -> u64 {
        self.metric_info
            .get(metric)
            .map(|entry| *entry)
            .unwrap_or(self.default_interval_ms)
    }

    /// Owner of a bin: a stable hash of `(metric, bin_index)` selected
    /// into the sorted membership snapshot.
    fn place(&self, metric: &str, bin_index: i64) -> String {
        let nodes = self.cluster.nodes();
        let hash = fnv1a(metric, bin_index);
        nodes[(hash % nodes.len() as u64) as usize].clone()
    }

    /// The location whose bin contains `timestamp`, created lazily.
    ///
    /// Existing locations keep their original owner across membership
    /// changes; only new bins are placed into the updated ring.
    pub fn locate(&self, metric: &str, timestamp: i64) -> Result<Location> {
        let interval = self.shard_interval(metric) as i64;
        let bin_index = timestamp.div_euclid(interval);
        let key = (metric.to_string(), bin_index);

        if let Some(existing) = self.locations.get(&key) {
            return Ok(existing.clone());
        }

        let lower_ts = bin_index * interval;
        let location = Location {
            metric: metric.to_string(),
            node_id: self.place(metric, bin_index),
            lower_ts,
            upper_ts: lower_ts + interval,
        };
        // the mapping is a pure function of the key and membership, so a
        // concurrent create lands on the same value
        let created = self
            .locations
            .entry(key)
            .or_insert_with(|| location.clone())
            .clone();
        self.persist()?;
        debug!(metric, bin_index, node = %created.node_id, "location created");
        self.mediator.publish(MetadataEvent::LocationCreated {
            db: self.db.clone(),
            namespace: self.namespace.clone(),
            location: created.clone(),
        });
        Ok(created)
    }

    /// Existing locations whose bins overlap the inclusive range.
    pub fn locations_overlapping(&self, metric: &str, range: TimeRange) -> Vec<Location> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut overlapping: Vec<Location> = self
            .locations
            .iter()
            .filter(|entry| entry.key().0 == metric && entry.value().overlaps(&range))
            .map(|entry| entry.value().clone())
            .collect();
        overlapping.sort_by_key(|l| l.lower_ts);
        overlapping
    }

    /// Every location of a metric, in time order.
    pub fn locations_for(&self, metric: &str) -> Vec<Location> {
        self.locations_overlapping(metric, TimeRange::all())
    }

    /// Remove the locations of a metric. The interval stays frozen.
    pub fn drop_metric(&self, metric: &str) -> Result<()> {
        self.locations.retain(|(m, _), _| m != metric);
        self.persist()
    }

    /// Converge the local cache on a broadcast event. Conflicting creates
    /// of the same bin resolve to the minimum node id.
    pub fn apply_event(&self, event: &MetadataEvent) -> Result<()> {
        match event {
            MetadataEvent::LocationCreated { db, namespace, location } => {
                if db != &self.db || namespace != &self.namespace {
                    return Ok(());
                }
                let key = (location.metric.clone(), location.bin_index());
                let mut changed = false;
                match self.locations.entry(key) {
                    dashmap::mapref::entry::Entry::Vacant(entry) => {
                        entry.insert(location.clone());
                        changed = true;
                    }
                    dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                        if location.node_id < entry.get().node_id {
                            entry.insert(location.clone());
                            changed = true;
                        }
                    }
                }
                if changed {
                    self.persist()?;
                }
            }
            MetadataEvent::MetricInfoPut {
                db,
                namespace,
                metric,
                shard_interval_ms,
            } => {
                if db != &self.db || namespace != &self.namespace {
                    return Ok(());
                }
                if !self.metric_info.contains_key(metric) {
                    self.metric_info.insert(metric.clone(), *shard_interval_ms);
                    self.persist()?;
                }
            }
        }
        Ok(())
    }

    /// Number of known locations.
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    pub fn metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = self
            .locations
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect();
        metrics.sort();
        metrics.dedup();
        metrics
    }
}

fn write_atomic(path: &PathBuf, payload: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// FNV-1a over the metric name and bin index. Stable across processes,
/// unlike the std hasher.
fn fnv1a(metric: &str, bin_index: i64) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in metric.as_bytes().iter().chain(bin_index.to_be_bytes().iter()) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(
        dir: &std::path::Path,
        cluster: Arc<ClusterView>,
    ) -> MetadataRegistry {
        MetadataRegistry::open(dir, "db", "ns", 100, cluster, ClusterMediator::new()).unwrap()
    }

    #[test]
    fn locate_creates_half_open_bins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
        registry.put_metric_info("people", 4).unwrap();

        let location = registry.locate("people", 2).unwrap();
        assert_eq!((location.lower_ts, location.upper_ts), (0, 4));
        // a timestamp on the boundary belongs to the upper bin
        let boundary = registry.locate("people", 4).unwrap();
        assert_eq!((boundary.lower_ts, boundary.upper_ts), (4, 8));
        // negative timestamps bin below zero
        let negative = registry.locate("people", -1).unwrap();
        assert_eq!((negative.lower_ts, negative.upper_ts), (-4, 0));
    }

    #[test]
    fn locate_is_idempotent_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
        let a = registry.locate("people", 7).unwrap();
        let b = registry.locate("people", 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(registry.location_count(), 1);
    }

    #[test]
    fn placement_is_deterministic_for_a_membership_snapshot() {
        let members = || {
            Arc::new(ClusterView::with_nodes(
                "node-1",
                ["node-2".to_string(), "node-3".to_string()],
            ))
        };
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = registry_with(dir_a.path(), members());
        let b = registry_with(dir_b.path(), members());

        for ts in [0, 150, 9_999, 123_456] {
            assert_eq!(
                a.locate("people", ts).unwrap().node_id,
                b.locate("people", ts).unwrap().node_id
            );
        }
    }

    #[test]
    fn existing_locations_survive_membership_change() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(ClusterView::single("node-1"));
        let registry = registry_with(dir.path(), cluster.clone());
        let before = registry.locate("people", 5).unwrap();

        cluster.add_node("node-0");
        assert_eq!(registry.locate("people", 5).unwrap().node_id, before.node_id);
    }

    #[test]
    fn interval_is_frozen_after_first_put() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
        registry.put_metric_info("people", 60_000).unwrap();
        // same interval is accepted, a different one is rejected
        registry.put_metric_info("people", 60_000).unwrap();
        assert!(matches!(
            registry.put_metric_info("people", 1_000),
            Err(Error::IntervalFrozen { .. })
        ));
    }

    #[test]
    fn overlapping_respects_inclusive_range_and_rejects_reversed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
        registry.put_metric_info("people", 4).unwrap();
        for ts in [2, 4, 6, 8, 10] {
            registry.locate("people", ts).unwrap();
        }

        let bins = registry.locations_overlapping("people", TimeRange::new(2, 4));
        assert_eq!(bins.len(), 2);
        assert!(registry
            .locations_overlapping("people", TimeRange::new(10, 2))
            .is_empty());
        assert_eq!(registry.locations_for("people").len(), 3);
    }

    #[test]
    fn conflicting_create_resolves_to_minimum_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-9")));
        let local = registry.locate("people", 0).unwrap();
        assert_eq!(local.node_id, "node-9");

        let remote = Location {
            metric: "people".into(),
            node_id: "node-1".into(),
            lower_ts: 0,
            upper_ts: 100,
        };
        registry
            .apply_event(&MetadataEvent::LocationCreated {
                db: "db".into(),
                namespace: "ns".into(),
                location: remote.clone(),
            })
            .unwrap();
        assert_eq!(registry.locate("people", 0).unwrap().node_id, "node-1");
    }

    #[test]
    fn reopen_reloads_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
            registry.put_metric_info("people", 4).unwrap();
            registry.locate("people", 2).unwrap();
        }
        let reopened = registry_with(dir.path(), Arc::new(ClusterView::single("node-1")));
        assert_eq!(reopened.shard_interval("people"), 4);
        assert_eq!(reopened.location_count(), 1);
    }
}
