//! Statement planning: semantic checks, time-range reduction and
//! predicate translation
//!
//! A condition reduces to (a) the inclusive time range used to prune the
//! shard set and (b) the predicate evaluated inside each shard. The range
//! is a conservative cover: it may admit a shard the predicate then
//! empties, never the other way round. Negation of an interior timestamp
//! range yields a non-contiguous pair; the cover falls back to the whole
//! axis and the in-shard predicate carries the disjunction.

use crate::error::{Error, Result};
use crate::index::{IndexPredicate, RangeBound};
use crate::metadata::TimeRange;
use crate::model::{FieldClass, TIMESTAMP_FIELD, VALUE_FIELD};
use crate::schema::Schema;
use crate::statement::{
    Aggregation, ComparisonOp, Expression, OrderClause, Projection, SelectStatement,
};

/// Execution shape of a select statement.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanKind {
    /// Plain rows
    Select,
    /// `count(...)` without grouping, answered by per-shard count queries
    GlobalCount,
    /// Grouped aggregation
    Grouped {
        field: String,
        aggregator: Aggregation,
    },
}

/// A validated, reduced select statement.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub metric: String,
    pub kind: PlanKind,
    pub time_range: TimeRange,
    pub predicate: IndexPredicate,
    pub projection: Projection,
    pub limit: Option<usize>,
    pub sort: Option<OrderClause>,
}

/// Validate a statement against the schema and reduce it to a plan.
pub fn plan_select(schema: &Schema, statement: &SelectStatement) -> Result<QueryPlan> {
    let kind = plan_kind(schema, statement)?;
    let (time_range, predicate) = reduce_condition(statement.condition.as_ref());
    Ok(QueryPlan {
        metric: statement.metric.clone(),
        kind,
        time_range,
        predicate,
        projection: statement.projection.clone(),
        limit: statement.limit,
        sort: statement.order_by.clone(),
    })
}

fn plan_kind(schema: &Schema, statement: &SelectStatement) -> Result<PlanKind> {
    let aggregations: Vec<(&str, Aggregation)> = match &statement.projection {
        Projection::AllFields => Vec::new(),
        Projection::Fields(fields) => fields
            .iter()
            .filter_map(|f| f.aggregation.map(|a| (f.name.as_str(), a)))
            .collect(),
    };

    for (field, _) in &aggregations {
        if *field != VALUE_FIELD {
            return Err(Error::InvalidStatement(
                "aggregations are only supported on the value field".into(),
            ));
        }
    }
    if aggregations.len() > 1 {
        return Err(Error::InvalidStatement(
            "a statement carries at most one aggregation".into(),
        ));
    }

    match &statement.group_by {
        Some(group_field) => {
            match schema.field(group_field) {
                Some(field) if field.class == FieldClass::Tag => {}
                Some(_) => {
                    return Err(Error::InvalidStatement(format!(
                        "group by is supported on tags only, '{group_field}' is not a tag"
                    )))
                }
                None => {
                    return Err(Error::InvalidStatement(format!(
                        "unknown group by field '{group_field}'"
                    )))
                }
            }
            let aggregator = aggregations
                .first()
                .map(|(_, a)| *a)
                .ok_or_else(|| Error::InvalidStatement("group-by requires aggregation".into()))?;
            // non-aggregated projected fields must be the group key itself
            if let Projection::Fields(fields) = &statement.projection {
                for field in fields {
                    if field.aggregation.is_none() && field.name != *group_field {
                        return Err(Error::InvalidStatement("group-by requires aggregation".into()));
                    }
                }
            } else {
                return Err(Error::InvalidStatement("group-by requires aggregation".into()));
            }
            Ok(PlanKind::Grouped {
                field: group_field.clone(),
                aggregator,
            })
        }
        None => match aggregations.first() {
            Some((_, Aggregation::Count)) => {
                if matches!(&statement.projection, Projection::Fields(fields) if fields.len() == 1) {
                    Ok(PlanKind::GlobalCount)
                } else {
                    Err(Error::InvalidStatement(
                        "count cannot be combined with other projected fields".into(),
                    ))
                }
            }
            Some((_, aggregator)) => Err(Error::InvalidStatement(format!(
                "{aggregator} requires GROUP BY"
            ))),
            None => Ok(PlanKind::Select),
        },
    }
}

/// Reduce a condition to the pruning time range and the in-shard
/// predicate. Absent conditions match everything.
pub fn reduce_condition(condition: Option<&Expression>) -> (TimeRange, IndexPredicate) {
    match condition {
        Some(expr) => {
            let (cover, _) = time_cover(expr);
            (cover, translate(expr))
        }
        None => (TimeRange::all(), IndexPredicate::All),
    }
}

/// Translate the full condition, timestamp conjuncts included, into the
/// shard predicate algebra.
fn translate(expr: &Expression) -> IndexPredicate {
    match expr {
        Expression::Comparison { field, op, value } => match op {
            ComparisonOp::Eq => IndexPredicate::term_eq(field.clone(), value.clone()),
            ComparisonOp::Gt => IndexPredicate::range(
                field.clone(),
                RangeBound::Exclusive(value.clone()),
                RangeBound::Unbounded,
            ),
            ComparisonOp::GtEq => IndexPredicate::range(
                field.clone(),
                RangeBound::Inclusive(value.clone()),
                RangeBound::Unbounded,
            ),
            ComparisonOp::Lt => IndexPredicate::range(
                field.clone(),
                RangeBound::Unbounded,
                RangeBound::Exclusive(value.clone()),
            ),
            ComparisonOp::LtEq => IndexPredicate::range(
                field.clone(),
                RangeBound::Unbounded,
                RangeBound::Inclusive(value.clone()),
            ),
        },
        Expression::Range { field, lo, hi } => IndexPredicate::range(
            field.clone(),
            RangeBound::Inclusive(lo.clone()),
            RangeBound::Inclusive(hi.clone()),
        ),
        Expression::And(a, b) => IndexPredicate::And(vec![translate(a), translate(b)]),
        Expression::Or(a, b) => IndexPredicate::Or(vec![translate(a), translate(b)]),
        Expression::Not(inner) => translate(inner).negate(),
    }
}

/// Conservative timestamp cover of an expression, plus whether the cover
/// is exact (needed to complement under NOT).
fn time_cover(expr: &Expression) -> (TimeRange, bool) {
    match expr {
        Expression::Comparison { field, op, value } if field == TIMESTAMP_FIELD => {
            let Some(v) = value.as_f64() else {
                return (TimeRange::all(), false);
            };
            let floor = v.floor() as i64;
            let ceil = v.ceil() as i64;
            let range = match op {
                ComparisonOp::Eq => TimeRange::new(ceil, floor),
                ComparisonOp::Gt => TimeRange::new(floor.saturating_add(1), i64::MAX),
                ComparisonOp::GtEq => TimeRange::new(ceil, i64::MAX),
                ComparisonOp::Lt => TimeRange::new(i64::MIN, ceil.saturating_sub(1)),
                ComparisonOp::LtEq => TimeRange::new(i64::MIN, floor),
            };
            (range, true)
        }
        Expression::Range { field, lo, hi } if field == TIMESTAMP_FIELD => {
            match (lo.as_f64(), hi.as_f64()) {
                (Some(lo), Some(hi)) => {
                    (TimeRange::new(lo.ceil() as i64, hi.floor() as i64), true)
                }
                _ => (TimeRange::all(), false),
            }
        }
        Expression::And(a, b) => {
            let (ra, ea) = time_cover(a);
            let (rb, eb) = time_cover(b);
            (ra.intersect(&rb), ea && eb)
        }
        Expression::Or(a, b) => {
            let (ra, _) = time_cover(a);
            let (rb, _) = time_cover(b);
            // the hull over-approximates a disjoint union
            (ra.hull(&rb), false)
        }
        Expression::Not(inner) => {
            let (range, exact) = time_cover(inner);
            if !exact {
                return (TimeRange::all(), false);
            }
            if range.is_empty() {
                return (TimeRange::all(), true);
            }
            match (range.start == i64::MIN, range.end == i64::MAX) {
                (true, true) => (TimeRange::new(1, 0), true),
                (true, false) => (TimeRange::new(range.end.saturating_add(1), i64::MAX), true),
                (false, true) => (TimeRange::new(i64::MIN, range.start.saturating_sub(1)), true),
                // interior range: the complement is a disjoint pair; the
                // residual predicate keeps the result exact
                (false, false) => (TimeRange::all(), false),
            }
        }
        _ => (TimeRange::all(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use crate::statement::ProjectionField;

    fn people_schema() -> Schema {
        Schema::from_record(
            "people",
            &Record::new(1, 1i64)
                .with_tag("name", "x")
                .with_dimension("creationDate", 0i64),
        )
    }

    fn select(projection: Projection, group_by: Option<&str>) -> SelectStatement {
        SelectStatement {
            metric: "people".into(),
            projection,
            condition: None,
            group_by: group_by.map(str::to_string),
            order_by: None,
            limit: None,
        }
    }

    #[test]
    fn timestamp_conjunction_reduces_to_closed_range() {
        let expr = Expression::comparison(TIMESTAMP_FIELD, ComparisonOp::GtEq, 2i64)
            .and(Expression::comparison(TIMESTAMP_FIELD, ComparisonOp::LtEq, 4i64));
        let (range, _) = reduce_condition(Some(&expr));
        assert_eq!(range, TimeRange::new(2, 4));
    }

    #[test]
    fn open_sides_use_extremes() {
        let expr = Expression::comparison(TIMESTAMP_FIELD, ComparisonOp::GtEq, 10i64);
        let (range, _) = reduce_condition(Some(&expr));
        assert_eq!(range, TimeRange::new(10, i64::MAX));
    }

    #[test]
    fn negated_boundary_comparison_flips_the_range() {
        let expr = Expression::comparison(TIMESTAMP_FIELD, ComparisonOp::GtEq, 10i64).negate();
        let (range, predicate) = reduce_condition(Some(&expr));
        assert_eq!(range, TimeRange::new(i64::MIN, 9));
        assert!(matches!(predicate, IndexPredicate::Not(_)));
    }

    #[test]
    fn negated_interior_range_falls_back_to_full_cover() {
        let expr = Expression::Range {
            field: TIMESTAMP_FIELD.into(),
            lo: 2i64.into(),
            hi: 4i64.into(),
        }
        .negate();
        let (range, _) = reduce_condition(Some(&expr));
        assert_eq!(range, TimeRange::all());
    }

    #[test]
    fn non_timestamp_conjuncts_do_not_narrow_the_cover() {
        let expr = Expression::comparison("name", ComparisonOp::Eq, "John")
            .and(Expression::comparison(TIMESTAMP_FIELD, ComparisonOp::Lt, 5i64));
        let (range, predicate) = reduce_condition(Some(&expr));
        assert_eq!(range, TimeRange::new(i64::MIN, 4));
        assert!(matches!(predicate, IndexPredicate::And(_)));
    }

    #[test]
    fn group_by_without_aggregation_is_rejected() {
        let schema = people_schema();
        let statement = select(
            Projection::Fields(vec![ProjectionField::plain("creationDate")]),
            Some("name"),
        );
        let err = plan_select(&schema, &statement).unwrap_err();
        match err {
            Error::InvalidStatement(detail) => {
                assert!(detail.contains("group-by requires aggregation"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn group_by_on_dimension_is_rejected() {
        let schema = people_schema();
        let statement = select(
            Projection::Fields(vec![ProjectionField::aggregated("value", Aggregation::Sum)]),
            Some("creationDate"),
        );
        assert!(matches!(
            plan_select(&schema, &statement),
            Err(Error::InvalidStatement(_))
        ));
    }

    #[test]
    fn aggregation_on_non_value_field_is_rejected() {
        let schema = people_schema();
        let statement = select(
            Projection::Fields(vec![ProjectionField::aggregated(
                "creationDate",
                Aggregation::Sum,
            )]),
            Some("name"),
        );
        assert!(matches!(
            plan_select(&schema, &statement),
            Err(Error::InvalidStatement(_))
        ));
    }

    #[test]
    fn grouped_sum_plans_as_grouped() {
        let schema = people_schema();
        let statement = select(
            Projection::Fields(vec![ProjectionField::aggregated("value", Aggregation::Sum)]),
            Some("name"),
        );
        let plan = plan_select(&schema, &statement).unwrap();
        assert_eq!(
            plan.kind,
            PlanKind::Grouped {
                field: "name".into(),
                aggregator: Aggregation::Sum
            }
        );
    }

    #[test]
    fn bare_count_plans_as_global_count() {
        let schema = people_schema();
        let statement = select(
            Projection::Fields(vec![ProjectionField::aggregated(
                "value",
                Aggregation::Count,
            )]),
            None,
        );
        let plan = plan_select(&schema, &statement).unwrap();
        assert_eq!(plan.kind, PlanKind::GlobalCount);

        let sum = select(
            Projection::Fields(vec![ProjectionField::aggregated("value", Aggregation::Sum)]),
            None,
        );
        assert!(matches!(
            plan_select(&schema, &sum),
            Err(Error::InvalidStatement(_))
        ));
    }
}
