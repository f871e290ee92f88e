//! Persistent schema documents, one per metric
//!
//! The authoritative copy of every schema lives as a single JSON document
//! keyed by `_metric`, with stored fields mapping each field name to its
//! class and index type tag. The in-memory registry is rebuilt by a full
//! scan on start.

use super::Schema;
use crate::error::{Error, Result};
use crate::model::{FieldClass, IndexType, SchemaField};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
struct SchemaDocument {
    #[serde(rename = "_metric")]
    metric: String,
    fields: BTreeMap<String, FieldEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FieldEntry {
    class: FieldClass,
    index_type: IndexType,
}

impl SchemaDocument {
    fn from_schema(schema: &Schema) -> Self {
        Self {
            metric: schema.metric().to_string(),
            fields: schema
                .fields()
                .map(|f| {
                    (
                        f.name.clone(),
                        FieldEntry {
                            class: f.class,
                            index_type: f.index_type,
                        },
                    )
                })
                .collect(),
        }
    }

    fn into_schema(self) -> Schema {
        Schema::from_fields(
            self.metric,
            self.fields.into_iter().map(|(name, entry)| {
                SchemaField::new(name, entry.class, entry.index_type)
            }),
        )
    }
}

/// Directory-backed schema document store.
#[derive(Debug)]
pub struct SchemaStore {
    dir: PathBuf,
}

impl SchemaStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn document_path(&self, metric: &str) -> PathBuf {
        self.dir.join(format!("{metric}.json"))
    }

    /// Full scan of the persisted documents.
    pub fn load_all(&self) -> Result<HashMap<String, Schema>> {
        let mut schemas = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<SchemaDocument>(&raw) {
                Ok(doc) => {
                    schemas.insert(doc.metric.clone(), doc.into_schema());
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable schema document");
                }
            }
        }
        Ok(schemas)
    }

    /// Write or replace the document for a metric in one step.
    pub fn upsert(&self, schema: &Schema) -> Result<()> {
        let doc = SchemaDocument::from_schema(schema);
        let payload = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::Internal(format!("schema document encode: {e}")))?;
        let path = self.document_path(schema.metric());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, metric: &str) -> Result<()> {
        let path = self.document_path(metric);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    #[test]
    fn upsert_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::open(dir.path()).unwrap();

        let schema = Schema::from_record(
            "people",
            &Record::new(1, 1i64)
                .with_dimension("name", "John")
                .with_tag("surname", "Doe"),
        );
        store.upsert(&schema).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.get("people"), Some(&schema));

        store.remove("people").unwrap();
        assert!(store.load_all().unwrap().is_empty());
        // removing again is a no-op
        store.remove("people").unwrap();
    }

    #[test]
    fn unreadable_documents_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
