//! Predicate algebra evaluated inside a shard
//!
//! The read coordinator translates statement conditions into this closed
//! set of index queries: term equality, point ranges, and boolean
//! composition. Negation is match-all subtraction.

use crate::model::Scalar;

/// One end of a point range.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBound {
    Unbounded,
    Inclusive(Scalar),
    Exclusive(Scalar),
}

/// A query evaluated against one shard's postings.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexPredicate {
    /// Matches every live document
    All,
    /// Exact match; analysed term query on VARCHAR fields, point-exact on
    /// numeric ones
    TermEq { field: String, value: Scalar },
    /// Point range over a numeric field
    Range {
        field: String,
        lo: RangeBound,
        hi: RangeBound,
    },
    And(Vec<IndexPredicate>),
    Or(Vec<IndexPredicate>),
    Not(Box<IndexPredicate>),
}

impl IndexPredicate {
    pub fn term_eq(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        IndexPredicate::TermEq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(field: impl Into<String>, lo: RangeBound, hi: RangeBound) -> Self {
        IndexPredicate::Range {
            field: field.into(),
            lo,
            hi,
        }
    }

    pub fn negate(self) -> Self {
        IndexPredicate::Not(Box::new(self))
    }
}

/// The analyser applied to VARCHAR terms at both index and query time:
/// case folding over the whole value.
pub fn analyze(text: &str) -> String {
    text.to_lowercase()
}
