//! Metric schemas and the compatibility rule
//!
//! A schema is the declared set of typed fields of a metric. Schemas are
//! created from the first record written to a metric and evolve additively:
//! an update may add fields but never change the index type of an existing
//! one.

mod registry;
mod store;

pub use registry::SchemaRegistry;
pub use store::SchemaStore;

use crate::error::SchemaViolation;
use crate::model::{FieldClass, IndexType, Record, SchemaField, TIMESTAMP_FIELD, VALUE_FIELD};
use std::collections::BTreeMap;

/// The declared set of typed fields of a metric.
///
/// Invariants: field names are unique, exactly one field has class `Value`
/// (named `value`) and exactly one has class `Timestamp` (named
/// `timestamp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    metric: String,
    fields: BTreeMap<String, SchemaField>,
}

impl Schema {
    /// Derive a candidate schema from a record: timestamp and value take
    /// their reserved classes, declared dimensions and tags their runtime
    /// types.
    pub fn from_record(metric: impl Into<String>, record: &Record) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            TIMESTAMP_FIELD.to_string(),
            SchemaField::new(TIMESTAMP_FIELD, FieldClass::Timestamp, IndexType::BigInt),
        );
        fields.insert(
            VALUE_FIELD.to_string(),
            SchemaField::new(VALUE_FIELD, FieldClass::Value, record.value.index_type()),
        );
        for (name, scalar) in &record.dimensions {
            fields.insert(
                name.clone(),
                SchemaField::new(name.clone(), FieldClass::Dimension, scalar.index_type()),
            );
        }
        for (name, scalar) in &record.tags {
            fields.insert(
                name.clone(),
                SchemaField::new(name.clone(), FieldClass::Tag, scalar.index_type()),
            );
        }
        Self {
            metric: metric.into(),
            fields,
        }
    }

    /// Rebuild a schema from its declared fields (persisted documents).
    pub fn from_fields(
        metric: impl Into<String>,
        fields: impl IntoIterator<Item = SchemaField>,
    ) -> Self {
        Self {
            metric: metric.into(),
            fields: fields
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.values()
    }

    pub fn fields_of_class(&self, class: FieldClass) -> impl Iterator<Item = &SchemaField> {
        self.fields.values().filter(move |f| f.class == class)
    }

    /// The declared type of the `value` field.
    pub fn value_type(&self) -> IndexType {
        self.fields
            .get(VALUE_FIELD)
            .map(|f| f.index_type)
            .unwrap_or(IndexType::Decimal)
    }

    /// Apply the compatibility rule and produce the effective schema.
    ///
    /// For each field present in both schemas the index type must be
    /// unchanged; the effective schema is the union, with the proposed
    /// fields overriding shared names (type-equal after the check). Fields
    /// present only in the stored schema are retained.
    pub fn merge(&self, proposed: &Schema) -> Result<Schema, Vec<SchemaViolation>> {
        let violations: Vec<SchemaViolation> = proposed
            .fields
            .values()
            .filter_map(|new| {
                self.fields.get(&new.name).and_then(|old| {
                    (old.index_type != new.index_type).then(|| SchemaViolation {
                        field: new.name.clone(),
                        expected: old.index_type,
                        found: new.index_type,
                    })
                })
            })
            .collect();
        if !violations.is_empty() {
            return Err(violations);
        }

        let mut fields = self.fields.clone();
        for field in proposed.fields.values() {
            fields.insert(field.name.clone(), field.clone());
        }
        Ok(Schema {
            metric: self.metric.clone(),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scalar;

    fn record_with(name: &str, scalar: Scalar) -> Record {
        let mut record = Record::new(1, 1i64);
        record.dimensions.insert(name.to_string(), scalar);
        record
    }

    #[test]
    fn from_record_declares_reserved_fields() {
        let schema = Schema::from_record("people", &Record::new(1, 1i64).with_tag("name", "John"));
        assert_eq!(
            schema.field(TIMESTAMP_FIELD).unwrap().class,
            FieldClass::Timestamp
        );
        assert_eq!(schema.field(VALUE_FIELD).unwrap().index_type, IndexType::BigInt);
        assert_eq!(schema.field("name").unwrap().class, FieldClass::Tag);
    }

    #[test]
    fn merge_is_monotone_additive() {
        let old = Schema::from_record("m", &record_with("a", Scalar::BigInt(1)));
        let new = Schema::from_record("m", &record_with("b", Scalar::Varchar("x".into())));
        let merged = old.merge(&new).unwrap();

        // superset of both field sets, shared fields unchanged
        for field in old.fields().chain(new.fields()) {
            assert_eq!(
                merged.field(&field.name).unwrap().index_type,
                field.index_type
            );
        }
    }

    #[test]
    fn merge_rejects_type_change_per_field() {
        let old = Schema::from_record("m", &record_with("a", Scalar::BigInt(1)));
        let new = Schema::from_record("m", &record_with("a", Scalar::Varchar("x".into())));
        let violations = old.merge(&new).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "a");
        assert_eq!(violations[0].expected, IndexType::BigInt);
        assert_eq!(violations[0].found, IndexType::Varchar);
    }

    #[test]
    fn merge_rejects_value_type_change() {
        let old = Schema::from_record("m", &Record::new(1, 1i64));
        let new = Schema::from_record("m", &Record::new(2, 1.5f64));
        let violations = old.merge(&new).unwrap_err();
        assert_eq!(violations[0].field, VALUE_FIELD);
    }
}
