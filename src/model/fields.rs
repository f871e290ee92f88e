//! Field classes and the record-to-index-fields function table

use super::{Scalar, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::error::{Error, Result, SchemaViolation};
use crate::model::IndexType;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};

/// Role of a field inside a metric schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldClass {
    #[serde(rename = "TIMESTAMP")]
    Timestamp,
    #[serde(rename = "VALUE")]
    Value,
    #[serde(rename = "DIMENSION")]
    Dimension,
    #[serde(rename = "TAG")]
    Tag,
}

/// One declared field of a metric schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub class: FieldClass,
    pub index_type: IndexType,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, class: FieldClass, index_type: IndexType) -> Self {
        Self {
            name: name.into(),
            class,
            index_type,
        }
    }
}

/// How a field is indexed inside a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFieldKind {
    /// Numeric point field, range-queryable
    Point,
    /// Analysed string field, term-queryable
    Term,
}

/// One serialisable index field produced for a record.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexField {
    pub name: String,
    pub kind: IndexFieldKind,
    pub scalar: Scalar,
    /// Stored verbatim for retrieval in addition to being indexed
    pub stored: bool,
}

/// Map a record to its index fields, validating it against the schema.
///
/// The timestamp becomes a point field named `timestamp` and is stored
/// verbatim; the value becomes a typed point field named `value`; VARCHAR
/// dimensions and tags become term fields, numeric ones point fields.
/// Fields the schema does not know are indexed by their runtime type
/// (unknown fields trigger schema evolution upstream); absent declared
/// fields are permitted (sparse rows).
pub fn materialize(schema: &Schema, record: &super::Record) -> Result<Vec<IndexField>> {
    let mut violations = Vec::new();
    let mut fields = Vec::with_capacity(2 + record.dimensions.len() + record.tags.len());

    fields.push(IndexField {
        name: TIMESTAMP_FIELD.to_string(),
        kind: IndexFieldKind::Point,
        scalar: Scalar::BigInt(record.timestamp),
        stored: true,
    });

    if let Some(declared) = schema.field(VALUE_FIELD) {
        if !declared.index_type.accepts(&record.value) {
            violations.push(SchemaViolation {
                field: VALUE_FIELD.to_string(),
                expected: declared.index_type,
                found: record.value.index_type(),
            });
        }
    }
    if !record.value.is_numeric() {
        violations.push(SchemaViolation {
            field: VALUE_FIELD.to_string(),
            expected: IndexType::Decimal,
            found: record.value.index_type(),
        });
    }
    fields.push(IndexField {
        name: VALUE_FIELD.to_string(),
        kind: IndexFieldKind::Point,
        scalar: record.value.clone(),
        stored: true,
    });

    for (name, scalar) in record.fields() {
        let declared_type = match schema.field(name) {
            Some(declared) => {
                if !declared.index_type.accepts(scalar) {
                    violations.push(SchemaViolation {
                        field: name.clone(),
                        expected: declared.index_type,
                        found: scalar.index_type(),
                    });
                    continue;
                }
                declared.index_type
            }
            None => scalar.index_type(),
        };
        let kind = if declared_type.is_numeric() {
            IndexFieldKind::Point
        } else {
            IndexFieldKind::Term
        };
        fields.push(IndexField {
            name: name.clone(),
            kind,
            scalar: scalar.clone(),
            stored: true,
        });
    }

    if violations.is_empty() {
        Ok(fields)
    } else {
        Err(Error::SchemaConflict {
            metric: schema.metric().to_string(),
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use crate::schema::Schema;

    fn people_schema() -> Schema {
        Schema::from_record(
            "people",
            &Record::new(1, 1i64)
                .with_dimension("name", "John")
                .with_dimension("creationDate", 123i64),
        )
    }

    #[test]
    fn materialize_produces_reserved_and_declared_fields() {
        let schema = people_schema();
        let record = Record::new(2, 1i64).with_dimension("name", "Bill");
        let fields = materialize(&schema, &record).unwrap();

        assert_eq!(fields[0].name, TIMESTAMP_FIELD);
        assert_eq!(fields[0].kind, IndexFieldKind::Point);
        assert_eq!(fields[1].name, VALUE_FIELD);
        let name = fields.iter().find(|f| f.name == "name").unwrap();
        assert_eq!(name.kind, IndexFieldKind::Term);
        assert!(name.stored);
    }

    #[test]
    fn materialize_rejects_type_mismatch() {
        let schema = people_schema();
        let record = Record::new(2, 1i64).with_dimension("name", 42i64);
        let err = materialize(&schema, &record).unwrap_err();
        match err {
            Error::SchemaConflict { violations, .. } => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].field, "name");
                assert_eq!(violations[0].expected, IndexType::Varchar);
                assert_eq!(violations[0].found, IndexType::BigInt);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn materialize_allows_unknown_and_missing_fields() {
        let schema = people_schema();
        let record = Record::new(2, 1i64).with_tag("city", "Rome");
        let fields = materialize(&schema, &record).unwrap();
        assert!(fields.iter().any(|f| f.name == "city"));
    }

    #[test]
    fn materialize_rejects_string_value() {
        let schema = people_schema();
        let record = Record {
            timestamp: 2,
            value: Scalar::Varchar("oops".into()),
            dimensions: Default::default(),
            tags: Default::default(),
        };
        assert!(materialize(&schema, &record).is_err());
    }
}
