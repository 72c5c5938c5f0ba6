//! Physical Operators Module

mod filter;
mod hash_aggregate;
mod limit;
mod physical_operator;
mod projection;
mod sort;
mod table_scan;

pub use filter::{FilterOperator, PARALLEL_FILTER_THRESHOLD};
pub use hash_aggregate::HashAggregateOperator;
pub use limit::LimitOperator;
pub use physical_operator::{PhysicalOperator, RowBatch, collect};
pub use projection::{ProjectionOperator, output_columns};
pub use sort::SortOperator;
pub use table_scan::{SCAN_BATCH_SIZE, TableScanOperator, column_union};
