//! Statement AST for the SQL-like query surface
//!
//! The endpoint parses statement text into these types; the coordinators
//! consume them. Only the subset the engine executes is represented:
//! projection, range/comparison/logical filters, single-field grouping
//! with aggregation, ordering and limits.

mod parser;

pub use parser::parse;

use crate::model::Scalar;
use std::collections::BTreeMap;
use std::fmt;

/// A parsed statement, dispatched by category.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlStatement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Delete(DeleteStatement),
    Drop(DropStatement),
}

/// `SELECT ... FROM metric [WHERE ...] [GROUP BY ...] [ORDER BY ...] [LIMIT n]`
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub metric: String,
    pub projection: Projection,
    pub condition: Option<Expression>,
    pub group_by: Option<String>,
    pub order_by: Option<OrderClause>,
    pub limit: Option<usize>,
}

/// Projected fields or `*`.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    AllFields,
    Fields(Vec<ProjectionField>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionField {
    pub name: String,
    pub aggregation: Option<Aggregation>,
}

impl ProjectionField {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aggregation: None,
        }
    }

    pub fn aggregated(name: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            name: name.into(),
            aggregation: Some(aggregation),
        }
    }
}

/// Aggregators over the `value` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl Aggregation {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(Aggregation::Sum),
            "count" => Some(Aggregation::Count),
            "min" => Some(Aggregation::Min),
            "max" => Some(Aggregation::Max),
            "avg" => Some(Aggregation::Avg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Avg => "avg",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderClause {
    pub field: String,
    pub descending: bool,
}

/// Comparison operators over a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

/// Boolean condition over dimensions, tags and the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Comparison {
        field: String,
        op: ComparisonOp,
        value: Scalar,
    },
    /// Inclusive range, `field BETWEEN lo AND hi`
    Range {
        field: String,
        lo: Scalar,
        hi: Scalar,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
}

impl Expression {
    pub fn comparison(field: impl Into<String>, op: ComparisonOp, value: impl Into<Scalar>) -> Self {
        Expression::Comparison {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Expression) -> Self {
        Expression::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expression) -> Self {
        Expression::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Expression::Not(Box::new(self))
    }
}

/// `INSERT INTO metric (columns...) VALUES (...)`; reserved column names
/// `timestamp` and `value` are mapped to the record's reserved fields.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub metric: String,
    pub columns: BTreeMap<String, Scalar>,
}

/// `DELETE FROM metric WHERE ...` (the condition is mandatory)
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub metric: String,
    pub condition: Expression,
}

/// `DROP TABLE metric`
#[derive(Debug, Clone, PartialEq)]
pub struct DropStatement {
    pub metric: String,
}
