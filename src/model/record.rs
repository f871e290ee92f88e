//! The record ("bit"): one time-stamped measurement with typed fields

use super::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One structured measurement on the time axis.
///
/// Dimensions and tags differ only in role: tags may participate in
/// grouping, dimensions are filterable but not grouped by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Milliseconds on the metric's time axis
    pub timestamp: i64,
    /// Numeric measurement value
    pub value: Scalar,
    /// Filterable typed attributes
    #[serde(default)]
    pub dimensions: BTreeMap<String, Scalar>,
    /// Filterable attributes that may participate in group-by
    #[serde(default)]
    pub tags: BTreeMap<String, Scalar>,
}

impl Record {
    pub fn new(timestamp: i64, value: impl Into<Scalar>) -> Self {
        Self {
            timestamp,
            value: value.into(),
            dimensions: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    /// Look up a dimension or tag by name, dimensions first.
    pub fn field(&self, name: &str) -> Option<&Scalar> {
        self.dimensions.get(name).or_else(|| self.tags.get(name))
    }

    /// All dimension and tag entries.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.dimensions.iter().chain(self.tags.iter())
    }

    /// Field lookup that also resolves the reserved `timestamp` and
    /// `value` names. Used for sorting and merge keys.
    pub fn sort_value(&self, name: &str) -> Option<Scalar> {
        match name {
            super::TIMESTAMP_FIELD => Some(Scalar::BigInt(self.timestamp)),
            super::VALUE_FIELD => Some(self.value.clone()),
            _ => self.field(name).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_lookup() {
        let record = Record::new(10, 1i64)
            .with_dimension("name", "John")
            .with_tag("surname", "Doe");

        assert_eq!(record.field("name"), Some(&Scalar::Varchar("John".into())));
        assert_eq!(record.field("surname"), Some(&Scalar::Varchar("Doe".into())));
        assert_eq!(record.field("missing"), None);
        assert_eq!(record.fields().count(), 2);
    }

    #[test]
    fn json_round_trip() {
        let record = Record::new(2, 1i64).with_dimension("name", "Bill");
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
