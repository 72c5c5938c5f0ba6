//! Storage module: backing store contract, row model and caches.
//!
//! Everything above this module talks to the remote store only through the
//! [`BackingStore`] trait. Remote store bindings implement it; [`memory_store::MemoryStore`] is
//! the in-process implementation.

pub mod cache;
pub mod dependency;
pub mod invalidation;
pub mod memory_store;
pub mod value;

use crate::error::TabulaResult;
use async_trait::async_trait;

pub use cache::{CacheInvalidator, CacheKey, CacheStats, Params, TenantCache};
pub use dependency::{Cascade, DependencyGraph};
pub use invalidation::{
    InvalidationContext, InvalidationRule, InvalidationStats, InvalidationStrategy, OperationKind,
    rows_path, table_source_key,
};
pub use memory_store::MemoryStore;
pub use value::{Row, ScalarValue};

/// Contract of the remote, quota-limited tabular store.
///
/// # Contract
///
/// - `connect`: opens a handle scoped to one tenant resource (a workbook,
///   a base, ...). Handles are pooled and reused by the core.
/// - `read_rows`: returns rows in positional order, each with `position`
///   set; `limit` bounds the number of rows returned.
/// - `append_rows`: appends in order and returns the stored rows with their
///   assigned positions. One call is one physical round trip.
/// - `update_row`: overwrites the row at `row.position`.
/// - `delete_row`: removes the row at `position`; later rows shift up by one.
///
/// Failures are reported as `TabulaError::BackingStore` tagged with a
/// [`StoreErrorCategory`](crate::error::StoreErrorCategory).
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Live connection handle.
    type Handle: Send + Sync + 'static;

    async fn connect(&self, tenant: &str, resource_id: &str) -> TabulaResult<Self::Handle>;

    async fn read_rows(
        &self,
        handle: &Self::Handle,
        table: &str,
        limit: Option<usize>,
    ) -> TabulaResult<Vec<Row>>;

    async fn append_rows(
        &self,
        handle: &Self::Handle,
        table: &str,
        rows: Vec<Row>,
    ) -> TabulaResult<Vec<Row>>;

    async fn update_row(&self, handle: &Self::Handle, table: &str, row: &Row) -> TabulaResult<Row>;

    async fn delete_row(&self, handle: &Self::Handle, table: &str, position: usize)
    -> TabulaResult<()>;
}
