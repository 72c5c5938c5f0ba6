//! Sort Operator: ORDER BY clause handling

use crate::error::TabulaResult;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch, collect};
use crate::sql::planner::SortDirection;
use std::cmp::Ordering;

/// Materializing stable sort over output columns.
pub struct SortOperator {
    input: Box<dyn PhysicalOperator>,
    /// (column, direction), already resolved against the input columns
    order_by: Vec<(String, SortDirection)>,
    sorted: Option<RowBatch>,
    emitted: bool,
}

impl SortOperator {
    pub fn new(input: Box<dyn PhysicalOperator>, order_by: Vec<(String, SortDirection)>) -> Self {
        Self {
            input,
            order_by,
            sorted: None,
            emitted: false,
        }
    }

    fn materialize(&mut self) -> TabulaResult<()> {
        let mut rows = collect(self.input.as_mut())?;
        rows.sort_by(|a, b| {
            self.order_by
                .iter()
                .map(|(column, direction)| {
                    let ord = a.get(column).total_cmp(b.get(column));
                    match direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        self.sorted = Some(rows);
        Ok(())
    }
}

impl PhysicalOperator for SortOperator {
    fn columns(&self) -> &[String] {
        self.input.columns()
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        if self.emitted {
            return Ok(None);
        }
        if self.sorted.is_none() {
            self.materialize()?;
        }
        self.emitted = true;
        Ok(self.sorted.take().filter(|rows| !rows.is_empty()))
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.sorted = None;
        self.emitted = false;
        self.input.reset()
    }
}
