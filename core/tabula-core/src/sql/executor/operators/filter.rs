//! Filter Operator: WHERE clause evaluation

use crate::error::TabulaResult;
use crate::sql::executor::expr::evaluate_conditions;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch};
use crate::sql::planner::ConditionToken;
use rayon::prelude::*;

/// Batches at least this large are filtered on the rayon pool.
pub const PARALLEL_FILTER_THRESHOLD: usize = 4096;

/// WHERE chain applied per row; row order is preserved.
pub struct FilterOperator {
    input: Box<dyn PhysicalOperator>,
    conditions: Vec<ConditionToken>,
}

impl FilterOperator {
    pub fn new(input: Box<dyn PhysicalOperator>, conditions: Vec<ConditionToken>) -> Self {
        Self { input, conditions }
    }
}

fn apply(conditions: &[ConditionToken], batch: RowBatch) -> RowBatch {
    if batch.len() >= PARALLEL_FILTER_THRESHOLD {
        batch
            .into_par_iter()
            .filter(|row| evaluate_conditions(conditions, row))
            .collect()
    } else {
        batch
            .into_iter()
            .filter(|row| evaluate_conditions(conditions, row))
            .collect()
    }
}

impl PhysicalOperator for FilterOperator {
    fn columns(&self) -> &[String] {
        self.input.columns()
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        loop {
            match self.input.next()? {
                None => return Ok(None),
                Some(batch) => {
                    if batch.is_empty() {
                        continue;
                    }
                    if self.conditions.is_empty() {
                        return Ok(Some(batch));
                    }
                    let filtered = apply(&self.conditions, batch);
                    if !filtered.is_empty() {
                        return Ok(Some(filtered));
                    }
                    // All rows filtered out, try next batch
                }
            }
        }
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.input.reset()
    }
}
