//! Query Executor Module
//!
//! Runs a [`Query`] over rows already fetched for its table:
//!
//! ```text
//! TableScan → Filter → (HashAggregate | Projection) → Sort → Limit
//! ```

use crate::error::{TabulaError, TabulaResult};
use crate::sql::planner::{AggregateTarget, ConditionToken, Query, SelectField};
use crate::storage::Row;
use std::sync::Arc;
use tracing::trace;

pub mod expr;
pub mod operators;

pub use expr::{evaluate_condition, evaluate_conditions, like_match};
pub use operators::{
    FilterOperator, HashAggregateOperator, LimitOperator, PhysicalOperator, ProjectionOperator,
    RowBatch, SortOperator, TableScanOperator,
};

/// Executor output before timing is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows fetched from the table
    pub total_rows: usize,
    /// Rows left after WHERE
    pub filtered_rows: usize,
}

/// Stateless query executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryExecutor;

impl QueryExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, query: &Query, data: Arc<Vec<Row>>) -> TabulaResult<ExecutionOutput> {
        let total_rows = data.len();
        let scan = TableScanOperator::new(query.table.clone(), data);

        // Unknown fields only surface when there is something to check against
        let bound;
        let query = if total_rows > 0 {
            bound = bind(query, scan.columns())?;
            &bound
        } else {
            query
        };

        let mut selection = FilterOperator::new(Box::new(scan), query.conditions.clone());
        let source_columns = selection.columns().to_vec();
        let filtered = operators::collect(&mut selection)?;
        let filtered_rows = filtered.len();
        trace!(table = %query.table, total_rows, filtered_rows, "selection done");

        let input: Box<dyn PhysicalOperator> = Box::new(
            TableScanOperator::new(query.table.clone(), Arc::new(filtered)).with_columns(source_columns),
        );
        let mut plan: Box<dyn PhysicalOperator> = if query.is_grouped() {
            Box::new(HashAggregateOperator::new(
                input,
                query.fields.clone(),
                query.group_by.clone(),
            ))
        } else {
            Box::new(ProjectionOperator::new(input, query.fields.clone()))
        };

        if !query.order_by.is_empty() {
            let wildcard_without_rows =
                total_rows == 0 && query.fields.iter().any(|f| matches!(f, SelectField::Wildcard));
            let mut keys = Vec::with_capacity(query.order_by.len());
            for order in &query.order_by {
                match resolve(&order.field, plan.columns()) {
                    Some(column) => keys.push((column.to_string(), order.direction)),
                    None if wildcard_without_rows => {}
                    None => {
                        return Err(TabulaError::execution(
                            format!("unknown ORDER BY column `{}`", order.field),
                            query.table.clone(),
                        ));
                    }
                }
            }
            plan = Box::new(SortOperator::new(plan, keys));
        }

        if let Some(limit) = query.limit {
            plan = Box::new(LimitOperator::new(plan, limit));
        }

        let columns = plan.columns().to_vec();
        let rows = operators::collect(plan.as_mut())?;
        Ok(ExecutionOutput {
            columns,
            rows,
            total_rows,
            filtered_rows,
        })
    }
}

/// Exact match first, then ASCII case-insensitive.
fn resolve<'a>(name: &str, columns: &'a [String]) -> Option<&'a str> {
    columns
        .iter()
        .find(|c| c.as_str() == name)
        .or_else(|| columns.iter().find(|c| c.eq_ignore_ascii_case(name)))
        .map(String::as_str)
}

/// Rewrites every source field reference to the fetched column it names.
fn bind(query: &Query, columns: &[String]) -> TabulaResult<Query> {
    let lookup = |name: &str| -> TabulaResult<String> {
        resolve(name, columns).map(str::to_string).ok_or_else(|| {
            TabulaError::execution(
                format!("unknown field `{name}`"),
                format!("table {}", query.table),
            )
        })
    };

    let mut bound = query.clone();
    for field in &mut bound.fields {
        match field {
            SelectField::Wildcard => {}
            SelectField::Field { name, .. } => *name = lookup(name)?,
            SelectField::Aggregate { target, .. } => {
                if let AggregateTarget::Field(name) = target {
                    *name = lookup(name)?;
                }
            }
        }
    }
    for token in &mut bound.conditions {
        if let ConditionToken::Condition(condition) = token {
            condition.field = lookup(&condition.field)?;
        }
    }
    for name in &mut bound.group_by {
        *name = lookup(name)?;
    }
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parser::{SqlParser, normalize};
    use crate::storage::ScalarValue;

    fn run(sql: &str, rows: Vec<Row>) -> TabulaResult<ExecutionOutput> {
        let query = SqlParser::new().parse_query(&normalize(sql))?;
        QueryExecutor::new().execute(&query, Arc::new(rows))
    }

    fn people() -> Vec<Row> {
        vec![
            Row::new().with("Name", "Ada").with("age", 36).with_position(1),
            Row::new().with("Name", "Bob").with("age", 17).with_position(2),
            Row::new().with("Name", "Cy").with("age", 52).with_position(3),
        ]
    }

    #[test]
    fn test_projection_with_alias_and_case_insensitive_fields() {
        let out = run("SELECT name AS who FROM people WHERE age >= 18", people()).unwrap();
        assert_eq!(out.columns, vec!["who"]);
        assert_eq!(out.total_rows, 3);
        assert_eq!(out.filtered_rows, 2);
        assert_eq!(out.rows[0].get("who"), &ScalarValue::from("Ada"));
        assert_eq!(out.rows[0].position, Some(1));
    }

    #[test]
    fn test_wildcard_copies_every_field() {
        let out = run("SELECT * FROM people ORDER BY age DESC LIMIT 1", people()).unwrap();
        assert_eq!(out.columns, vec!["Name", "age"]);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].get("Name"), &ScalarValue::from("Cy"));
    }

    #[test]
    fn test_unknown_field_is_execution_error() {
        let err = run("SELECT salary FROM people", people()).unwrap_err();
        assert!(matches!(err, TabulaError::Execution { .. }));
        // nothing fetched, nothing to validate against
        let out = run("SELECT salary FROM people", vec![]).unwrap();
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_unknown_order_by_column() {
        let err = run("SELECT name FROM people ORDER BY age", people()).unwrap_err();
        assert!(matches!(err, TabulaError::Execution { .. }));
    }

    #[test]
    fn test_sort_is_stable_with_tie_breaker() {
        let rows = vec![
            Row::new().with("g", 1).with("v", "b"),
            Row::new().with("g", 0).with("v", "z"),
            Row::new().with("g", 1).with("v", "a"),
            Row::new().with("g", 1).with("v", "a").with("extra", 1),
        ];
        let out = run("SELECT * FROM t ORDER BY g DESC, v", rows).unwrap();
        let order: Vec<_> = out.rows.iter().map(|r| r.get("v").as_text()).collect();
        assert_eq!(order, vec!["a", "a", "b", "z"]);
        assert_eq!(out.rows[0].get("extra"), &ScalarValue::Null);
        assert_eq!(out.rows[1].get("extra"), &ScalarValue::Int64(1));
    }
}
