//! Statement lowering
//!
//! Turns one sqlparser `Statement` into a [`Query`]. Only the subset the
//! executor understands is accepted; everything else is a parse error naming
//! the clause.

use crate::error::{TabulaError, TabulaResult};
use crate::sql::planner::types::*;
use crate::storage::ScalarValue;
use sqlparser::ast::{
    BinaryOperator as SqlBinaryOp, Distinct, DuplicateTreatment, Expr as SqlExpr, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, ObjectName, OrderByExpr as SqlOrderByExpr,
    Query as SqlQuery, Select, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value,
};

/// Lowers parsed statements into [`Query`].
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Exactly one SELECT statement is accepted.
    pub fn plan(&self, statements: &[Statement]) -> TabulaResult<Query> {
        let statement = match statements {
            [single] => single,
            [] => return Err(TabulaError::parse("statement", "empty query")),
            _ => {
                return Err(TabulaError::parse(
                    "statement",
                    format!("expected one statement, found {}", statements.len()),
                ));
            }
        };
        match statement {
            Statement::Query(query) => self.plan_query(query),
            other => Err(TabulaError::parse(
                "statement",
                format!("only SELECT is supported, found: {other}"),
            )),
        }
    }

    fn plan_query(&self, query: &SqlQuery) -> TabulaResult<Query> {
        if query.with.is_some() {
            return Err(TabulaError::parse("WITH", "common table expressions are not supported"));
        }
        if query.offset.is_some() {
            return Err(TabulaError::parse("OFFSET", "OFFSET is not supported"));
        }
        if !query.limit_by.is_empty() {
            return Err(TabulaError::parse("LIMIT", "LIMIT BY is not supported"));
        }

        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::Query(_) => {
                return Err(TabulaError::parse("FROM", "subqueries are not supported"));
            }
            _ => {
                return Err(TabulaError::parse(
                    "SELECT",
                    "set operations and VALUES are not supported",
                ));
            }
        };

        let mut planned = self.plan_select(select)?;

        // ORDER BY lives on Query, not Select, in sqlparser 0.52
        if let Some(order_by) = &query.order_by {
            planned.order_by = order_by
                .exprs
                .iter()
                .map(plan_order_by_expr)
                .collect::<TabulaResult<_>>()?;
        }

        if let Some(limit) = &query.limit {
            planned.limit = Some(extract_usize(limit)?);
        }

        Ok(planned)
    }

    fn plan_select(&self, select: &Select) -> TabulaResult<Query> {
        if select.having.is_some() {
            return Err(TabulaError::parse("HAVING", "HAVING is not supported"));
        }
        let table = plan_from(select)?;

        let mut fields = Vec::with_capacity(select.projection.len());
        let mut items = select.projection.iter();
        match &select.distinct {
            None => {}
            Some(Distinct::Distinct) => {
                // `SELECT DISTINCT(field) [AS alias]` counts distinct values of `field`.
                let first = items
                    .next()
                    .ok_or_else(|| TabulaError::parse("SELECT", "DISTINCT needs a field"))?;
                let (expr, alias) = split_item(first)?;
                let field = field_name(expr).ok_or_else(|| {
                    TabulaError::parse("SELECT", format!("DISTINCT expects a field, found {expr}"))
                })?;
                fields.push(SelectField::Aggregate {
                    function: AggregateFunction::CountDistinct,
                    target: AggregateTarget::Field(field),
                    alias,
                });
            }
            Some(Distinct::On(_)) => {
                return Err(TabulaError::parse("SELECT", "DISTINCT ON is not supported"));
            }
        }
        for item in items {
            fields.push(plan_select_item(item)?);
        }
        if fields.is_empty() {
            return Err(TabulaError::parse("SELECT", "empty select list"));
        }

        let mut conditions = Vec::new();
        if let Some(selection) = &select.selection {
            flatten_where(selection, &mut conditions)?;
        }

        let group_by = match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|expr| {
                    field_name(expr).ok_or_else(|| {
                        TabulaError::parse("GROUP BY", format!("expected a field, found {expr}"))
                    })
                })
                .collect::<TabulaResult<Vec<_>>>()?,
            GroupByExpr::All(_) => {
                return Err(TabulaError::parse("GROUP BY", "GROUP BY ALL is not supported"));
            }
        };

        Ok(Query {
            fields,
            table,
            conditions,
            group_by,
            order_by: Vec::new(),
            limit: None,
        })
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn plan_from(select: &Select) -> TabulaResult<String> {
    let from = match select.from.as_slice() {
        [single] => single,
        [] => return Err(TabulaError::parse("FROM", "missing FROM clause")),
        _ => return Err(TabulaError::parse("FROM", "only one table is supported")),
    };
    if !from.joins.is_empty() {
        return Err(TabulaError::parse("JOIN", "joins are not supported"));
    }
    match &from.relation {
        TableFactor::Table { name, .. } => object_name(name),
        TableFactor::Derived { .. } => Err(TabulaError::parse("FROM", "subqueries are not supported")),
        other => Err(TabulaError::parse("FROM", format!("unsupported table source: {other}"))),
    }
}

fn object_name(name: &ObjectName) -> TabulaResult<String> {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| TabulaError::parse("FROM", "missing table name"))
}

fn split_item(item: &SelectItem) -> TabulaResult<(&SqlExpr, Option<String>)> {
    match item {
        SelectItem::UnnamedExpr(expr) => Ok((expr, None)),
        SelectItem::ExprWithAlias { expr, alias } => Ok((expr, Some(alias.value.clone()))),
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
            Err(TabulaError::parse("SELECT", "DISTINCT * is not supported"))
        }
    }
}

fn plan_select_item(item: &SelectItem) -> TabulaResult<SelectField> {
    let (expr, alias) = match item {
        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
            return Ok(SelectField::Wildcard);
        }
        SelectItem::UnnamedExpr(expr) => (expr, None),
        SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
    };

    if let Some(name) = field_name(expr) {
        return Ok(SelectField::Field { name, alias });
    }
    if let SqlExpr::Function(func) = expr {
        let name = func.name.to_string();
        let function = AggregateFunction::from_name(&name).ok_or_else(|| {
            TabulaError::parse("SELECT", format!("unknown aggregate function {name}"))
        })?;
        let (target, distinct) = plan_function_arg(&name, &func.args)?;
        let function = match (function, distinct) {
            (AggregateFunction::Count, true) => AggregateFunction::CountDistinct,
            (function, false) => function,
            (_, true) => {
                return Err(TabulaError::parse(
                    "SELECT",
                    format!("DISTINCT is only supported inside COUNT, found {name}"),
                ));
            }
        };
        if target == AggregateTarget::Star && function != AggregateFunction::Count {
            return Err(TabulaError::parse("SELECT", format!("{name}(*) is not supported")));
        }
        return Ok(SelectField::Aggregate {
            function,
            target,
            alias,
        });
    }
    Err(TabulaError::parse(
        "SELECT",
        format!("expressions in the select list are not supported: {expr}"),
    ))
}

/// Single argument of an aggregate call, plus whether it was `DISTINCT`.
fn plan_function_arg(name: &str, args: &FunctionArguments) -> TabulaResult<(AggregateTarget, bool)> {
    let arg_list = match args {
        FunctionArguments::List(arg_list) => arg_list,
        FunctionArguments::None => {
            return Err(TabulaError::parse("SELECT", format!("{name} needs an argument")));
        }
        FunctionArguments::Subquery(_) => {
            return Err(TabulaError::parse("SELECT", "subqueries are not supported"));
        }
    };
    let distinct = matches!(arg_list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
    let arg = match arg_list.args.as_slice() {
        [arg] => arg,
        _ => {
            return Err(TabulaError::parse(
                "SELECT",
                format!("{name} takes exactly one argument"),
            ));
        }
    };
    let arg_expr = match arg {
        FunctionArg::Unnamed(arg_expr) => arg_expr,
        FunctionArg::Named { arg, .. } => arg,
        #[allow(unreachable_patterns)]
        _ => return Err(TabulaError::parse("SELECT", format!("unsupported argument to {name}"))),
    };
    match arg_expr {
        FunctionArgExpr::Wildcard | FunctionArgExpr::QualifiedWildcard(_) => {
            Ok((AggregateTarget::Star, distinct))
        }
        FunctionArgExpr::Expr(expr) => field_name(expr)
            .map(|field| (AggregateTarget::Field(field), distinct))
            .ok_or_else(|| {
                TabulaError::parse("SELECT", format!("{name} expects a field, found {expr}"))
            }),
    }
}

/// Plain or qualified column reference; parentheses around a bare field are allowed.
fn field_name(expr: &SqlExpr) -> Option<String> {
    match expr {
        SqlExpr::Identifier(ident) => Some(ident.value.clone()),
        SqlExpr::CompoundIdentifier(idents) => idents.last().map(|i| i.value.clone()),
        SqlExpr::Nested(inner) => match inner.as_ref() {
            SqlExpr::Identifier(_) | SqlExpr::CompoundIdentifier(_) => field_name(inner),
            _ => None,
        },
        _ => None,
    }
}

/// In-order walk of the AND/OR tree, which restores the source order of
/// conditions and combinators.
fn flatten_where(expr: &SqlExpr, out: &mut Vec<ConditionToken>) -> TabulaResult<()> {
    match expr {
        SqlExpr::BinaryOp { left, op, right } if matches!(op, SqlBinaryOp::And | SqlBinaryOp::Or) => {
            flatten_where(left, out)?;
            out.push(ConditionToken::Logical(if *op == SqlBinaryOp::And {
                LogicalOperator::And
            } else {
                LogicalOperator::Or
            }));
            flatten_where(right, out)
        }
        SqlExpr::Nested(_) => Err(TabulaError::parse(
            "WHERE",
            format!("parenthesized conditions are not supported: {expr}"),
        )),
        _ => {
            out.push(ConditionToken::Condition(plan_condition(expr)?));
            Ok(())
        }
    }
}

fn plan_condition(expr: &SqlExpr) -> TabulaResult<Condition> {
    let condition = match expr {
        SqlExpr::BinaryOp { left, op, right } => {
            let field = condition_field(left)?;
            let operator = match op {
                SqlBinaryOp::Eq => ConditionOperator::Eq,
                SqlBinaryOp::NotEq => ConditionOperator::NotEq,
                SqlBinaryOp::Gt => ConditionOperator::Gt,
                SqlBinaryOp::GtEq => ConditionOperator::GtEq,
                SqlBinaryOp::Lt => ConditionOperator::Lt,
                SqlBinaryOp::LtEq => ConditionOperator::LtEq,
                other => {
                    return Err(TabulaError::parse(
                        "WHERE",
                        format!("unsupported operator {other}"),
                    ));
                }
            };
            let value = literal(right)?;
            match (operator, value) {
                (ConditionOperator::Eq, ScalarValue::Null) => Condition {
                    field,
                    operator: ConditionOperator::IsNull,
                    value: ConditionValue::None,
                },
                (ConditionOperator::NotEq, ScalarValue::Null) => Condition {
                    field,
                    operator: ConditionOperator::IsNotNull,
                    value: ConditionValue::None,
                },
                (operator, ScalarValue::Null) => {
                    return Err(TabulaError::parse(
                        "WHERE",
                        format!("cannot compare {field} {operator} NULL"),
                    ));
                }
                (operator, value) => Condition {
                    field,
                    operator,
                    value: ConditionValue::Scalar(value),
                },
            }
        }
        SqlExpr::IsNull(inner) => Condition {
            field: condition_field(inner)?,
            operator: ConditionOperator::IsNull,
            value: ConditionValue::None,
        },
        SqlExpr::IsNotNull(inner) => Condition {
            field: condition_field(inner)?,
            operator: ConditionOperator::IsNotNull,
            value: ConditionValue::None,
        },
        SqlExpr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        }
        | SqlExpr::ILike {
            negated,
            expr: inner,
            pattern,
            ..
        } => Condition {
            field: condition_field(inner)?,
            operator: if *negated {
                ConditionOperator::NotLike
            } else {
                ConditionOperator::Like
            },
            value: ConditionValue::Scalar(literal(pattern)?),
        },
        SqlExpr::InList {
            expr: inner,
            list,
            negated,
        } => Condition {
            field: condition_field(inner)?,
            operator: if *negated {
                ConditionOperator::NotIn
            } else {
                ConditionOperator::In
            },
            value: ConditionValue::List(list.iter().map(literal).collect::<TabulaResult<_>>()?),
        },
        SqlExpr::Nested(_) => {
            return Err(TabulaError::parse(
                "WHERE",
                format!("parenthesized conditions are not supported: {expr}"),
            ));
        }
        other => {
            return Err(TabulaError::parse(
                "WHERE",
                format!("unsupported condition: {other}"),
            ));
        }
    };
    Ok(condition)
}

fn condition_field(expr: &SqlExpr) -> TabulaResult<String> {
    match expr {
        SqlExpr::Identifier(Ident { value, .. }) => Ok(value.clone()),
        SqlExpr::CompoundIdentifier(idents) => idents
            .last()
            .map(|i| i.value.clone())
            .ok_or_else(|| TabulaError::parse("WHERE", "empty field name")),
        other => Err(TabulaError::parse(
            "WHERE",
            format!("left side of a condition must be a field, found {other}"),
        )),
    }
}

/// Right-hand literal. Double-quoted text is a string, not a column.
fn literal(expr: &SqlExpr) -> TabulaResult<ScalarValue> {
    match expr {
        SqlExpr::Value(value) => match value {
            Value::Number(n, _) => parse_number(n, false),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(ScalarValue::Utf8(s.clone())),
            Value::Boolean(b) => Ok(ScalarValue::Boolean(*b)),
            Value::Null => Ok(ScalarValue::Null),
            other => Err(TabulaError::parse("WHERE", format!("unsupported literal {other}"))),
        },
        SqlExpr::UnaryOp { op, expr: inner } => match (op, inner.as_ref()) {
            (UnaryOperator::Minus, SqlExpr::Value(Value::Number(n, _))) => parse_number(n, true),
            (UnaryOperator::Plus, SqlExpr::Value(Value::Number(n, _))) => parse_number(n, false),
            _ => Err(TabulaError::parse("WHERE", format!("unsupported literal {expr}"))),
        },
        SqlExpr::Identifier(ident) if ident.quote_style == Some('"') => {
            Ok(ScalarValue::Utf8(ident.value.clone()))
        }
        other => Err(TabulaError::parse(
            "WHERE",
            format!("right side of a condition must be a literal, found {other}"),
        )),
    }
}

fn parse_number(text: &str, negative: bool) -> TabulaResult<ScalarValue> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(ScalarValue::Int64(if negative { -i } else { i }));
    }
    text.parse::<f64>()
        .map(|f| ScalarValue::Float64(if negative { -f } else { f }))
        .map_err(|_| TabulaError::parse("WHERE", format!("invalid number {text}")))
}

fn plan_order_by_expr(ob: &SqlOrderByExpr) -> TabulaResult<OrderBy> {
    let field = field_name(&ob.expr).ok_or_else(|| {
        TabulaError::parse("ORDER BY", format!("expected an output column, found {}", ob.expr))
    })?;
    Ok(OrderBy {
        field,
        direction: match ob.asc {
            Some(false) => SortDirection::Desc,
            _ => SortDirection::Asc,
        },
    })
}

/// LIMIT value as `usize`
fn extract_usize(expr: &SqlExpr) -> TabulaResult<usize> {
    match expr {
        SqlExpr::Value(Value::Number(n, _)) => n
            .parse::<usize>()
            .map_err(|_| TabulaError::parse("LIMIT", format!("invalid row count {n}"))),
        _ => Err(TabulaError::parse(
            "LIMIT",
            format!("expected a non-negative integer, found {expr}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn plan(sql: &str) -> TabulaResult<Query> {
        let statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
        QueryPlanner::new().plan(&statements)
    }

    fn clause_of(err: TabulaError) -> String {
        match err {
            TabulaError::Parse { clause, .. } => clause,
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_where_is_flattened_in_source_order() {
        let query = plan("select * from t where a = 1 or b = 2 and c = 3").unwrap();
        let ops: Vec<_> = query
            .conditions
            .iter()
            .map(|t| match t {
                ConditionToken::Condition(c) => c.field.clone(),
                ConditionToken::Logical(LogicalOperator::And) => "AND".to_string(),
                ConditionToken::Logical(LogicalOperator::Or) => "OR".to_string(),
            })
            .collect();
        assert_eq!(ops, vec!["a", "OR", "b", "AND", "c"]);
    }

    #[test]
    fn test_parentheses_are_rejected() {
        let err = plan("select * from t where (a = 1 or b = 2) and c = 3").unwrap_err();
        assert_eq!(clause_of(err), "WHERE");
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let query = plan("select * from t where a = null and b != null").unwrap();
        let ops: Vec<_> = query.conditions().map(|c| c.operator).collect();
        assert_eq!(ops, vec![ConditionOperator::IsNull, ConditionOperator::IsNotNull]);
    }

    #[test]
    fn test_literals() {
        let query =
            plan(r#"select * from t where a = -5 and b = 'Spring' and c in (1, 2.5, "x") and d like 'a%'"#)
                .unwrap();
        let values: Vec<_> = query.conditions().map(|c| c.value.clone()).collect();
        assert_eq!(values[0], ConditionValue::Scalar(ScalarValue::Int64(-5)));
        assert_eq!(values[1], ConditionValue::Scalar(ScalarValue::Utf8("Spring".into())));
        assert_eq!(
            values[2],
            ConditionValue::List(vec![
                ScalarValue::Int64(1),
                ScalarValue::Float64(2.5),
                ScalarValue::Utf8("x".into())
            ])
        );
        assert_eq!(values[3], ConditionValue::Scalar(ScalarValue::Utf8("a%".into())));
    }

    #[test]
    fn test_aggregates_and_aliases() {
        let query = plan(
            "select campaign, count(*) as n, sum(total), count(distinct customer) from orders group by campaign",
        )
        .unwrap();
        assert_eq!(
            query.fields,
            vec![
                SelectField::Field {
                    name: "campaign".into(),
                    alias: None
                },
                SelectField::Aggregate {
                    function: AggregateFunction::Count,
                    target: AggregateTarget::Star,
                    alias: Some("n".into())
                },
                SelectField::Aggregate {
                    function: AggregateFunction::Sum,
                    target: AggregateTarget::Field("total".into()),
                    alias: None
                },
                SelectField::Aggregate {
                    function: AggregateFunction::CountDistinct,
                    target: AggregateTarget::Field("customer".into()),
                    alias: None
                },
            ]
        );
        assert_eq!(query.group_by, vec!["campaign"]);
        assert_eq!(query.fields[2].output_name().unwrap(), "sum_total");
    }

    #[test]
    fn test_leading_distinct() {
        let query = plan("select distinct(campaign) as campaigns from orders").unwrap();
        assert_eq!(
            query.fields,
            vec![SelectField::Aggregate {
                function: AggregateFunction::CountDistinct,
                target: AggregateTarget::Field("campaign".into()),
                alias: Some("campaigns".into())
            }]
        );
    }

    #[test]
    fn test_order_and_limit() {
        let query = plan("select a from t order by a desc, b limit 3").unwrap();
        assert_eq!(
            query.order_by,
            vec![
                OrderBy {
                    field: "a".into(),
                    direction: SortDirection::Desc
                },
                OrderBy {
                    field: "b".into(),
                    direction: SortDirection::Asc
                },
            ]
        );
        assert_eq!(query.limit, Some(3));
    }

    #[test]
    fn test_unsupported_clauses() {
        assert_eq!(clause_of(plan("select * from a join b on a.id = b.id").unwrap_err()), "JOIN");
        assert_eq!(
            clause_of(plan("select a, count(*) from t group by a having count(*) > 1").unwrap_err()),
            "HAVING"
        );
        assert_eq!(clause_of(plan("select * from t limit 1 offset 2").unwrap_err()), "OFFSET");
        assert_eq!(clause_of(plan("select a + 1 from t").unwrap_err()), "SELECT");
        assert_eq!(clause_of(plan("delete from t").unwrap_err()), "statement");
        assert_eq!(clause_of(plan("select * from t; select * from u").unwrap_err()), "statement");
        assert_eq!(clause_of(plan("select sum(*) from t").unwrap_err()), "SELECT");
    }
}
