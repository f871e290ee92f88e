//! Error types for timegrain

use crate::model::IndexType;

/// Result type alias for timegrain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for timegrain
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Proposed schema is incompatible with the stored one; the write is rejected whole
    #[error("schema conflict for metric '{metric}': {}", format_violations(.violations))]
    SchemaConflict {
        metric: String,
        violations: Vec<SchemaViolation>,
    },
    /// Read or drop on a metric with no schema
    #[error("metric not found: {0}")]
    MetricNotFound(String),
    /// Statement fails semantic checks
    #[error("invalid statement: {0}")]
    InvalidStatement(String),
    /// Statement text could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
    /// Deadline elapsed before the operation completed
    #[error("operation timed out")]
    Timeout,
    /// `avg` across shards requires every partial to carry a count channel
    #[error("distributed avg requires per-shard counts")]
    UnsupportedDistributedAvg,
    /// Underlying index failure; not retried
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Target shard owner unreachable
    #[error("shard owner unreachable: {0}")]
    Unavailable(String),
    /// Shard interval for a metric is set once and frozen
    #[error("shard interval already set for metric '{metric}' ({interval_ms} ms)")]
    IntervalFrozen { metric: String, interval_ms: u64 },
    /// Corrupt persisted state (segment, schema document, commit log entry)
    #[error("corrupt data: {0}")]
    Corrupt(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// One field-level schema incompatibility: the field exists in both the
/// stored and the proposed schema with different index types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub field: String,
    pub expected: IndexType,
    pub found: IndexType,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field '{}' is {} but record carries {}",
            self.field,
            self.expected.tag(),
            self.found.tag()
        )
    }
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Corrupt(e.to_string())
    }
}
