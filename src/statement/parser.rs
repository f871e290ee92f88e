//! SQL text to statement AST translation
//!
//! The grammar itself is sqlparser's; this module reduces the generic AST
//! to the subset the engine executes and rejects everything else with a
//! parse error.

use super::{
    Aggregation, ComparisonOp, DeleteStatement, DropStatement, Expression, InsertStatement,
    OrderClause, Projection, ProjectionField, SelectStatement, SqlStatement,
};
use crate::error::{Error, Result};
use crate::model::{Scalar, VALUE_FIELD};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, GroupByExpr, ObjectName, ObjectType,
    Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins, UnaryOperator,
    Value, Values,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeMap;

/// Parse one statement of the supported SQL subset.
pub fn parse(sql: &str) -> Result<SqlStatement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| Error::Parse(e.to_string()))?;
    if statements.len() != 1 {
        return Err(Error::Parse(format!(
            "expected exactly one statement, got {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        Statement::Query(query) => convert_select(*query).map(SqlStatement::Select),
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => convert_insert(table_name, columns, source).map(SqlStatement::Insert),
        Statement::Delete {
            from, selection, ..
        } => convert_delete(from, selection).map(SqlStatement::Delete),
        Statement::Drop {
            object_type, names, ..
        } => {
            if object_type != ObjectType::Table {
                return Err(Error::Parse("only DROP TABLE is supported".into()));
            }
            let name = names
                .first()
                .map(object_name)
                .ok_or_else(|| Error::Parse("DROP requires a metric name".into()))?;
            Ok(SqlStatement::Drop(DropStatement { metric: name }))
        }
        other => Err(Error::Parse(format!("unsupported statement: {other}"))),
    }
}

fn convert_select(query: Query) -> Result<SelectStatement> {
    let select = match *query.body {
        SetExpr::Select(select) => *select,
        other => return Err(Error::Parse(format!("unsupported query body: {other}"))),
    };

    let metric = table_name(&select.from)?;
    let projection = convert_projection(&select)?;
    let condition = select.selection.map(convert_expr).transpose()?;
    let group_by = convert_group_by(&select.group_by)?;

    let order_by = match query.order_by.first() {
        Some(order) => match &order.expr {
            Expr::Identifier(ident) => Some(OrderClause {
                field: ident.value.clone(),
                descending: order.asc == Some(false),
            }),
            other => {
                return Err(Error::Parse(format!("unsupported order expression: {other}")))
            }
        },
        None => None,
    };

    let limit = match query.limit {
        Some(Expr::Value(Value::Number(raw, _))) => Some(
            raw.parse::<usize>()
                .map_err(|_| Error::Parse(format!("invalid limit: {raw}")))?,
        ),
        Some(other) => return Err(Error::Parse(format!("unsupported limit: {other}"))),
        None => None,
    };

    Ok(SelectStatement {
        metric,
        projection,
        condition,
        group_by,
        order_by,
        limit,
    })
}

fn convert_projection(select: &Select) -> Result<Projection> {
    if select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_)))
    {
        if select.projection.len() != 1 {
            return Err(Error::Parse("`*` cannot be combined with other fields".into()));
        }
        return Ok(Projection::AllFields);
    }

    let mut fields = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) => expr,
            SelectItem::ExprWithAlias { expr, .. } => expr,
            other => return Err(Error::Parse(format!("unsupported projection: {other}"))),
        };
        fields.push(projection_field(expr)?);
    }
    Ok(Projection::Fields(fields))
}

fn projection_field(expr: &Expr) -> Result<ProjectionField> {
    match expr {
        Expr::Identifier(ident) => Ok(ProjectionField::plain(ident.value.clone())),
        Expr::Function(func) => {
            let name = object_name(&func.name);
            let aggregation = Aggregation::from_name(&name)
                .ok_or_else(|| Error::Parse(format!("unknown aggregation: {name}")))?;
            let field = match func.args.as_slice() {
                [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => VALUE_FIELD.to_string(),
                [FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Identifier(ident)))] => {
                    ident.value.clone()
                }
                _ => {
                    return Err(Error::Parse(format!(
                        "{aggregation} takes a single field argument"
                    )))
                }
            };
            Ok(ProjectionField::aggregated(field, aggregation))
        }
        other => Err(Error::Parse(format!("unsupported projection: {other}"))),
    }
}

fn convert_group_by(group_by: &GroupByExpr) -> Result<Option<String>> {
    let exprs = match group_by {
        GroupByExpr::Expressions(exprs) => exprs,
        GroupByExpr::All => return Err(Error::Parse("GROUP BY ALL is not supported".into())),
    };
    match exprs.as_slice() {
        [] => Ok(None),
        [Expr::Identifier(ident)] => Ok(Some(ident.value.clone())),
        _ => Err(Error::Parse("only single-field GROUP BY is supported".into())),
    }
}

fn convert_expr(expr: Expr) -> Result<Expression> {
    match expr {
        Expr::Nested(inner) => convert_expr(*inner),
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(convert_expr(*expr)?.negate()),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(convert_expr(*left)?.and(convert_expr(*right)?)),
            BinaryOperator::Or => Ok(convert_expr(*left)?.or(convert_expr(*right)?)),
            BinaryOperator::Eq => comparison(*left, ComparisonOp::Eq, *right),
            BinaryOperator::NotEq => comparison(*left, ComparisonOp::Eq, *right).map(Expression::negate),
            BinaryOperator::Gt => comparison(*left, ComparisonOp::Gt, *right),
            BinaryOperator::GtEq => comparison(*left, ComparisonOp::GtEq, *right),
            BinaryOperator::Lt => comparison(*left, ComparisonOp::Lt, *right),
            BinaryOperator::LtEq => comparison(*left, ComparisonOp::LtEq, *right),
            other => Err(Error::Parse(format!("unsupported operator: {other}"))),
        },
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let field = identifier(*expr)?;
            let range = Expression::Range {
                field,
                lo: literal(*low)?,
                hi: literal(*high)?,
            };
            Ok(if negated { range.negate() } else { range })
        }
        other => Err(Error::Parse(format!("unsupported condition: {other}"))),
    }
}

fn comparison(left: Expr, op: ComparisonOp, right: Expr) -> Result<Expression> {
    // Accept both `field op literal` and `literal op field`, flipping the
    // operator in the reversed form.
    match (left, right) {
        (Expr::Identifier(ident), value_expr) => Ok(Expression::Comparison {
            field: ident.value,
            op,
            value: literal(value_expr)?,
        }),
        (value_expr, Expr::Identifier(ident)) => {
            let flipped = match op {
                ComparisonOp::Eq => ComparisonOp::Eq,
                ComparisonOp::Gt => ComparisonOp::Lt,
                ComparisonOp::GtEq => ComparisonOp::LtEq,
                ComparisonOp::Lt => ComparisonOp::Gt,
                ComparisonOp::LtEq => ComparisonOp::GtEq,
            };
            Ok(Expression::Comparison {
                field: ident.value,
                op: flipped,
                value: literal(value_expr)?,
            })
        }
        (left, _) => Err(Error::Parse(format!("unsupported comparison on: {left}"))),
    }
}

fn identifier(expr: Expr) -> Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value),
        other => Err(Error::Parse(format!("expected a field name, got: {other}"))),
    }
}

fn literal(expr: Expr) -> Result<Scalar> {
    match expr {
        Expr::Value(Value::Number(raw, _)) => number(&raw),
        Expr::Value(Value::SingleQuotedString(s)) => Ok(Scalar::Varchar(s)),
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(*expr)? {
            Scalar::BigInt(v) => Ok(Scalar::BigInt(-v)),
            Scalar::Decimal(v) => Ok(Scalar::Decimal(-v)),
            other => Err(Error::Parse(format!("cannot negate: {other}"))),
        },
        other => Err(Error::Parse(format!("expected a literal, got: {other}"))),
    }
}

fn number(raw: &str) -> Result<Scalar> {
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(Scalar::BigInt(v));
    }
    raw.parse::<f64>()
        .map(Scalar::Decimal)
        .map_err(|_| Error::Parse(format!("invalid number: {raw}")))
}

fn object_name(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

fn table_name(from: &[TableWithJoins]) -> Result<String> {
    match from {
        [TableWithJoins { relation, joins }] if joins.is_empty() => match relation {
            TableFactor::Table { name, .. } => Ok(object_name(name)),
            other => Err(Error::Parse(format!("unsupported table source: {other}"))),
        },
        _ => Err(Error::Parse("exactly one metric must be selected from".into())),
    }
}

fn convert_insert(
    table_name: ObjectName,
    columns: Vec<sqlparser::ast::Ident>,
    source: Option<Box<Query>>,
) -> Result<InsertStatement> {
    let metric = object_name(&table_name);
    if columns.is_empty() {
        return Err(Error::Parse("INSERT requires an explicit column list".into()));
    }
    let rows = match source.map(|q| *q.body) {
        Some(SetExpr::Values(Values { rows, .. })) => rows,
        _ => return Err(Error::Parse("INSERT requires a VALUES clause".into())),
    };
    let row = match rows.as_slice() {
        [row] => row,
        _ => return Err(Error::Parse("INSERT takes exactly one row".into())),
    };
    if row.len() != columns.len() {
        return Err(Error::Parse(format!(
            "INSERT has {} columns but {} values",
            columns.len(),
            row.len()
        )));
    }

    let mut values = BTreeMap::new();
    for (column, expr) in columns.into_iter().zip(row.iter().cloned()) {
        values.insert(column.value, literal(expr)?);
    }
    Ok(InsertStatement {
        metric,
        columns: values,
    })
}

fn convert_delete(
    from: Vec<TableWithJoins>,
    selection: Option<Expr>,
) -> Result<DeleteStatement> {
    let metric = table_name(&from)?;
    let condition = selection
        .map(convert_expr)
        .transpose()?
        .ok_or_else(|| Error::Parse("DELETE requires a WHERE condition".into()))?;
    Ok(DeleteStatement { metric, condition })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_select(sql: &str) -> SelectStatement {
        match parse(sql).unwrap() {
            SqlStatement::Select(select) => select,
            other => panic!("expected select, got {other:?}"),
        }
    }

    #[test]
    fn select_star_with_limit() {
        let select = parse_select("SELECT * FROM people LIMIT 5");
        assert_eq!(select.metric, "people");
        assert_eq!(select.projection, Projection::AllFields);
        assert_eq!(select.limit, Some(5));
        assert!(select.condition.is_none());
    }

    #[test]
    fn select_with_timestamp_conjunction() {
        let select =
            parse_select("SELECT name FROM people WHERE timestamp >= 2 AND timestamp <= 4");
        let expected = Expression::comparison("timestamp", ComparisonOp::GtEq, 2i64)
            .and(Expression::comparison("timestamp", ComparisonOp::LtEq, 4i64));
        assert_eq!(select.condition, Some(expected));
        assert_eq!(
            select.projection,
            Projection::Fields(vec![ProjectionField::plain("name")])
        );
    }

    #[test]
    fn select_with_negated_condition() {
        let select = parse_select("SELECT name FROM people WHERE NOT(timestamp >= 10) LIMIT 4");
        let expected =
            Expression::comparison("timestamp", ComparisonOp::GtEq, 10i64).negate();
        assert_eq!(select.condition, Some(expected));
    }

    #[test]
    fn select_grouped_aggregation() {
        let select =
            parse_select("SELECT sum(value) FROM people WHERE timestamp >= 2 GROUP BY name");
        assert_eq!(select.group_by.as_deref(), Some("name"));
        assert_eq!(
            select.projection,
            Projection::Fields(vec![ProjectionField::aggregated("value", Aggregation::Sum)])
        );
    }

    #[test]
    fn count_star_targets_value() {
        let select = parse_select("SELECT count(*) FROM people");
        assert_eq!(
            select.projection,
            Projection::Fields(vec![ProjectionField::aggregated(
                "value",
                Aggregation::Count
            )])
        );
    }

    #[test]
    fn order_by_direction() {
        let select = parse_select("SELECT * FROM people ORDER BY value DESC");
        assert_eq!(
            select.order_by,
            Some(OrderClause {
                field: "value".into(),
                descending: true
            })
        );
    }

    #[test]
    fn string_equality_and_reversed_comparison() {
        let select = parse_select("SELECT * FROM people WHERE 'Doe' = surname AND 2 < timestamp");
        let expected = Expression::comparison("surname", ComparisonOp::Eq, "Doe")
            .and(Expression::comparison("timestamp", ComparisonOp::Gt, 2i64));
        assert_eq!(select.condition, Some(expected));
    }

    #[test]
    fn insert_row() {
        let statement =
            parse("INSERT INTO people (timestamp, value, name) VALUES (2, 1, 'John')").unwrap();
        match statement {
            SqlStatement::Insert(insert) => {
                assert_eq!(insert.metric, "people");
                assert_eq!(insert.columns.get("timestamp"), Some(&Scalar::BigInt(2)));
                assert_eq!(insert.columns.get("value"), Some(&Scalar::BigInt(1)));
                assert_eq!(
                    insert.columns.get("name"),
                    Some(&Scalar::Varchar("John".into()))
                );
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn delete_requires_condition() {
        assert!(matches!(
            parse("DELETE FROM people"),
            Err(Error::Parse(_))
        ));
        let statement = parse("DELETE FROM people WHERE timestamp < 5").unwrap();
        assert!(matches!(statement, SqlStatement::Delete(_)));
    }

    #[test]
    fn drop_table() {
        let statement = parse("DROP TABLE people").unwrap();
        assert_eq!(
            statement,
            SqlStatement::Drop(DropStatement {
                metric: "people".into()
            })
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(parse("SELEKT zzz"), Err(Error::Parse(_))));
        assert!(matches!(parse("SELECT 1; SELECT 2"), Err(Error::Parse(_))));
    }
}
