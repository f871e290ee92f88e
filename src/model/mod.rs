//! Core data model: typed scalars, records and index field materialisation
//!
//! A record ("bit") is one time-stamped measurement with a typed numeric
//! value plus typed dimensions and tags. Every scalar carries an explicit
//! runtime tag; the mapping from scalar to index fields is a function
//! table, never reflection.

mod fields;
mod record;
mod scalar;

pub use fields::{materialize, FieldClass, IndexField, IndexFieldKind, SchemaField};
pub use record::Record;
pub use scalar::{IndexType, Scalar};

/// Reserved field name for the record timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";
/// Reserved field name for the record value.
pub const VALUE_FIELD: &str = "value";
/// Reserved field carrying group sizes produced by the grouping collector.
pub const COUNT_FIELD: &str = "_count";
