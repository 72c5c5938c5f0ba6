//! TableScan Operator: Sequential batch emission

use crate::error::TabulaResult;
use crate::sql::executor::operators::{PhysicalOperator, RowBatch};
use crate::storage::Row;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Rows per emitted batch.
pub const SCAN_BATCH_SIZE: usize = 8192;

/// Emits fetched rows in fixed-size batches.
pub struct TableScanOperator {
    table: String,
    columns: Vec<String>,
    data: Arc<Vec<Row>>,
    batch_size: usize,
    position: usize,
}

impl TableScanOperator {
    pub fn new(table: impl Into<String>, data: Arc<Vec<Row>>) -> Self {
        let columns = column_union(&data);
        Self {
            table: table.into(),
            columns,
            data,
            batch_size: SCAN_BATCH_SIZE,
            position: 0,
        }
    }

    /// Overrides the column list, e.g. to keep the fetched table's columns
    /// after filtering.
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }
}

/// Sorted union of the field names of every row.
pub fn column_union(rows: &[Row]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for row in rows {
        for name in row.fields.keys() {
            if !names.contains(name.as_str()) {
                names.insert(name.clone());
            }
        }
    }
    names.into_iter().collect()
}

impl PhysicalOperator for TableScanOperator {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> TabulaResult<Option<RowBatch>> {
        if self.position >= self.data.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.data.len());
        let batch = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(Some(batch))
    }

    fn reset(&mut self) -> TabulaResult<()> {
        self.position = 0;
        Ok(())
    }
}
