//! HashAggregate Operator: GROUP BY and aggregate functions

use crate::error::TabulaResult;
use crate::sql::executor::operators::projection::output_columns;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch, collect};
use crate::sql::planner::{AggregateFunction, AggregateTarget, SelectField};
use crate::storage::{Row, ScalarValue};
use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

const KEY_SEPARATOR: char = '\u{1f}';

/// Groups rows by the concatenated group-by values and evaluates the select
/// list once per group. Groups are emitted in first-appearance order.
///
/// With no GROUP BY the whole input is one group, emitted even when empty.
pub struct HashAggregateOperator {
    input: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    fields: Vec<SelectField>,
    group_by: Vec<String>,
    done: bool,
}

impl HashAggregateOperator {
    pub fn new(input: Box<dyn PhysicalOperator>, fields: Vec<SelectField>, group_by: Vec<String>) -> Self {
        let columns = output_columns(&fields, input.columns());
        Self {
            input,
            columns,
            fields,
            group_by,
            done: false,
        }
    }

    fn aggregate_all(&mut self) -> TabulaResult<RowBatch> {
        let rows = collect(self.input.as_mut())?;

        let groups: Vec<Vec<&Row>> = if self.group_by.is_empty() {
            vec![rows.iter().collect()]
        } else {
            let mut index: AHashMap<String, usize> = AHashMap::new();
            let mut groups: Vec<Vec<&Row>> = Vec::new();
            for row in &rows {
                let key = group_key(row, &self.group_by);
                match index.get(&key) {
                    Some(&slot) => groups[slot].push(row),
                    None => {
                        index.insert(key, groups.len());
                        groups.push(vec![row]);
                    }
                }
            }
            groups
        };

        Ok(groups
            .iter()
            .map(|members| self.evaluate_group(members))
            .collect())
    }

    fn evaluate_group(&self, members: &[&Row]) -> Row {
        let first = members.first();
        let mut out = Row::new();
        for field in &self.fields {
            match field {
                SelectField::Wildcard => {
                    if let Some(first) = first {
                        for (name, value) in &first.fields {
                            out.set(name.clone(), value.clone());
                        }
                    }
                }
                SelectField::Field { name, .. } => {
                    let value = first.map(|row| row.get(name).clone()).unwrap_or_default();
                    out.set(field.output_name().unwrap_or_default(), value);
                }
                SelectField::Aggregate {
                    function, target, ..
                } => {
                    out.set(
                        field.output_name().unwrap_or_default(),
                        aggregate(*function, target, members),
                    );
                }
            }
        }
        out
    }
}

fn group_key(row: &Row, group_by: &[String]) -> String {
    let mut key = String::new();
    for (i, field) in group_by.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&row.get(field).as_text());
    }
    key
}

/// Integral when the value is an integer or integer text.
#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn of(value: &ScalarValue) -> Option<Number> {
        match value {
            ScalarValue::Int64(i) => Some(Number::Int(*i)),
            ScalarValue::Boolean(b) => Some(Number::Int(*b as i64)),
            ScalarValue::Utf8(s) => match s.trim().parse::<i64>() {
                Ok(i) => Some(Number::Int(i)),
                Err(_) => value.as_f64().map(Number::Float),
            },
            other => other.as_f64().map(Number::Float),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    fn into_scalar(self) -> ScalarValue {
        match self {
            Number::Int(i) => ScalarValue::Int64(i),
            Number::Float(f) => ScalarValue::Float64(f),
        }
    }
}

fn aggregate(function: AggregateFunction, target: &AggregateTarget, members: &[&Row]) -> ScalarValue {
    let field = match target {
        AggregateTarget::Star => return ScalarValue::Int64(members.len() as i64),
        AggregateTarget::Field(field) => field,
    };
    let values = members.iter().map(|row| row.get(field)).filter(|v| !v.is_missing());

    match function {
        AggregateFunction::Count => ScalarValue::Int64(values.count() as i64),
        AggregateFunction::CountDistinct => {
            let distinct: AHashSet<String> = values.map(ScalarValue::as_text).collect();
            ScalarValue::Int64(distinct.len() as i64)
        }
        AggregateFunction::Sum => {
            let numbers: SmallVec<[Number; 16]> = values.filter_map(Number::of).collect();
            sum(&numbers)
        }
        AggregateFunction::Avg => {
            let numbers: SmallVec<[Number; 16]> = values.filter_map(Number::of).collect();
            if numbers.is_empty() {
                return ScalarValue::Null;
            }
            let total: f64 = numbers.iter().map(|n| n.as_f64()).sum();
            ScalarValue::Float64(total / numbers.len() as f64)
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let want_max = function == AggregateFunction::Max;
            values
                .filter_map(Number::of)
                .reduce(|best, n| {
                    let better = if want_max {
                        n.as_f64() > best.as_f64()
                    } else {
                        n.as_f64() < best.as_f64()
                    };
                    if better { n } else { best }
                })
                .map(Number::into_scalar)
                .unwrap_or(ScalarValue::Null)
        }
    }
}

/// 0 for an empty set; Int64 while every input is integral and the sum fits.
fn sum(numbers: &[Number]) -> ScalarValue {
    let mut exact: Option<i64> = Some(0);
    let mut float = 0.0;
    for n in numbers {
        float += n.as_f64();
        exact = match (exact, n) {
            (Some(acc), Number::Int(i)) => acc.checked_add(*i),
            _ => None,
        };
    }
    match exact {
        Some(total) => ScalarValue::Int64(total),
        None => ScalarValue::Float64(float),
    }
}

impl PhysicalOperator for HashAggregateOperator {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let out = self.aggregate_all()?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.done = false;
        self.input.reset()
    }
}
