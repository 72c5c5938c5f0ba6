//! Physical Operator Trait: Volcano Execution Model

use crate::error::TabulaResult;
use crate::storage::Row;

/// Unit of data flowing between operators.
pub type RowBatch = Vec<Row>;

/// Pull-based operator.
pub trait PhysicalOperator: Send {
    /// Output column names, in result order.
    fn columns(&self) -> &[String];

    /// Next batch, `None` once exhausted.
    fn next(&mut self) -> TabulaResult<Option<RowBatch>>;

    /// Rewind for re-execution.
    fn reset(&mut self) -> TabulaResult<()>;
}

/// Drain an operator into one vector.
pub fn collect(op: &mut dyn PhysicalOperator) -> TabulaResult<RowBatch> {
    let mut out = Vec::new();
    while let Some(batch) = op.next()? {
        if out.is_empty() {
            out = batch;
        } else {
            out.extend(batch);
        }
    }
    Ok(out)
}
