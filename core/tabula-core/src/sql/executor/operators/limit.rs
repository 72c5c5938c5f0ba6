//! Limit Operator: LIMIT clause handling

use crate::error::TabulaResult;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch};

pub struct LimitOperator {
    input: Box<dyn PhysicalOperator>,
    count: usize,
    /// Total rows emitted so far
    emitted: usize,
}

impl LimitOperator {
    pub fn new(input: Box<dyn PhysicalOperator>, count: usize) -> Self {
        Self {
            input,
            count,
            emitted: 0,
        }
    }
}

impl PhysicalOperator for LimitOperator {
    fn columns(&self) -> &[String] {
        self.input.columns()
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        if self.emitted >= self.count {
            return Ok(None);
        }
        match self.input.next()? {
            None => Ok(None),
            Some(mut batch) => {
                let remaining = self.count - self.emitted;
                batch.truncate(remaining);
                self.emitted += batch.len();
                Ok(Some(batch))
            }
        }
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.emitted = 0;
        self.input.reset()
    }
}
