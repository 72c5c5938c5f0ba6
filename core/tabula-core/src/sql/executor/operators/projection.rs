//! Projection Operator: SELECT column selection and aliasing

use crate::error::TabulaResult;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch};
use crate::sql::planner::SelectField;
use crate::storage::Row;

/// Per-row projection for ungrouped queries. `*` copies every field.
pub struct ProjectionOperator {
    input: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    fields: Vec<SelectField>,
}

impl ProjectionOperator {
    pub fn new(input: Box<dyn PhysicalOperator>, fields: Vec<SelectField>) -> Self {
        let columns = output_columns(&fields, input.columns());
        Self {
            input,
            columns,
            fields,
        }
    }

    fn project(&self, row: Row) -> Row {
        if let [SelectField::Wildcard] = self.fields.as_slice() {
            return row;
        }
        let mut out = Row {
            position: row.position,
            ..Row::default()
        };
        for field in &self.fields {
            match field {
                SelectField::Wildcard => {
                    for (name, value) in &row.fields {
                        out.set(name.clone(), value.clone());
                    }
                }
                SelectField::Field { name, .. } => {
                    out.set(field.output_name().unwrap_or_default(), row.get(name).clone());
                }
                // Aggregates never reach an ungrouped projection
                SelectField::Aggregate { .. } => {}
            }
        }
        out
    }
}

/// Result column names for a select list; `*` expands to `input`.
/// Duplicates keep their first position.
pub fn output_columns(fields: &[SelectField], input: &[String]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !columns.iter().any(|c| c == name) {
            columns.push(name.to_string());
        }
    };
    for field in fields {
        match field.output_name() {
            Some(name) => push(&name),
            None => input.iter().for_each(|name| push(name)),
        }
    }
    columns
}

impl PhysicalOperator for ProjectionOperator {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        match self.input.next()? {
            None => Ok(None),
            Some(batch) => Ok(Some(batch.into_iter().map(|row| self.project(row)).collect())),
        }
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.input.reset()
    }
}
