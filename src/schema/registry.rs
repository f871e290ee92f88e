//! Per-namespace schema registry
//!
//! Holds the schemas of one (db, namespace). The write coordinator is the
//! only mutator; readers observe a consistent copy-on-write snapshot that
//! is swapped atomically on every update.

use super::{Schema, SchemaStore};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

type Snapshot = Arc<HashMap<String, Arc<Schema>>>;

/// Registry of metric schemas for one (db, namespace).
#[derive(Debug)]
pub struct SchemaRegistry {
    store: SchemaStore,
    snapshot: RwLock<Snapshot>,
}

impl SchemaRegistry {
    /// Open the registry, rebuilding the in-memory map from the persisted
    /// documents.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let store = SchemaStore::open(dir.as_ref())?;
        let loaded = store.load_all()?;
        info!(schemas = loaded.len(), dir = %dir.as_ref().display(), "schema registry opened");
        let map: HashMap<String, Arc<Schema>> = loaded
            .into_iter()
            .map(|(metric, schema)| (metric, Arc::new(schema)))
            .collect();
        Ok(Self {
            store,
            snapshot: RwLock::new(Arc::new(map)),
        })
    }

    /// Current schema of a metric, if any.
    pub fn get(&self, metric: &str) -> Option<Arc<Schema>> {
        self.snapshot.read().get(metric).cloned()
    }

    /// All known metrics.
    pub fn metrics(&self) -> Vec<String> {
        self.snapshot.read().keys().cloned().collect()
    }

    /// Evolve the schema of a metric under the compatibility rule.
    ///
    /// The effective schema is persisted as an upsert before the snapshot
    /// swap, so a crash between the two never leaves the metric schemaless.
    pub fn update(&self, metric: &str, proposed: &Schema) -> Result<Arc<Schema>> {
        let current = self.get(metric);
        let effective = match &current {
            Some(existing) => match existing.merge(proposed) {
                Ok(merged) => merged,
                Err(violations) => {
                    return Err(Error::SchemaConflict {
                        metric: metric.to_string(),
                        violations,
                    })
                }
            },
            None => proposed.clone(),
        };

        // Unchanged schemas skip the disk write on the hot path.
        if let Some(existing) = &current {
            if **existing == effective {
                return Ok(existing.clone());
            }
        }

        self.store.upsert(&effective)?;
        let effective = Arc::new(effective);
        let mut snapshot = self.snapshot.write();
        let mut map = HashMap::clone(&snapshot);
        map.insert(metric.to_string(), effective.clone());
        *snapshot = Arc::new(map);
        debug!(metric, fields = effective.fields().count(), "schema updated");
        Ok(effective)
    }

    /// Drop the schema of a metric. Idempotent.
    pub fn delete(&self, metric: &str) -> Result<()> {
        self.store.remove(metric)?;
        let mut snapshot = self.snapshot.write();
        if snapshot.contains_key(metric) {
            let mut map = HashMap::clone(&snapshot);
            map.remove(metric);
            *snapshot = Arc::new(map);
        }
        Ok(())
    }

    /// Drop every schema of the namespace.
    pub fn delete_all(&self) -> Result<()> {
        self.store.clear()?;
        *self.snapshot.write() = Arc::new(HashMap::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    fn registry() -> (tempfile::TempDir, SchemaRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn update_creates_then_evolves() {
        let (_dir, registry) = registry();
        let first = Schema::from_record("people", &Record::new(1, 1i64).with_tag("name", "John"));
        registry.update("people", &first).unwrap();

        let second = Schema::from_record(
            "people",
            &Record::new(2, 1i64).with_dimension("creationDate", 7i64),
        );
        let effective = registry.update("people", &second).unwrap();

        assert!(effective.field("name").is_some());
        assert!(effective.field("creationDate").is_some());
    }

    #[test]
    fn conflicting_update_leaves_schema_untouched() {
        let (_dir, registry) = registry();
        let first = Schema::from_record("people", &Record::new(1, 1i64).with_tag("name", "John"));
        registry.update("people", &first).unwrap();

        let bad = Schema::from_record("people", &Record::new(2, 1i64).with_tag("name", 9i64));
        let err = registry.update("people", &bad).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict { .. }));
        assert_eq!(*registry.get("people").unwrap(), first);
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = SchemaRegistry::open(dir.path()).unwrap();
            let schema =
                Schema::from_record("people", &Record::new(1, 1i64).with_tag("name", "John"));
            registry.update("people", &schema).unwrap();
        }
        let reopened = SchemaRegistry::open(dir.path()).unwrap();
        assert!(reopened.get("people").is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, registry) = registry();
        let schema = Schema::from_record("people", &Record::new(1, 1i64));
        registry.update("people", &schema).unwrap();
        registry.delete("people").unwrap();
        registry.delete("people").unwrap();
        assert!(registry.get("people").is_none());
    }

    #[test]
    fn delete_all_empties_the_namespace() {
        let (_dir, registry) = registry();
        for metric in ["people", "readings"] {
            let schema = Schema::from_record(metric, &Record::new(1, 1i64));
            registry.update(metric, &schema).unwrap();
        }
        registry.delete_all().unwrap();
        assert!(registry.metrics().is_empty());
        assert!(registry.store.load_all().unwrap().is_empty());
    }
}
