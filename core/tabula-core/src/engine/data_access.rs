//! Data access facade
//!
//! Row-level reads and writes for a tenant table. Reads go through the row
//! cache, then the batch coordinator; writes go through the batch
//! coordinator and then invalidate everything derived from the table.

use crate::batch::{BatchCoordinator, OpOutput, Operation};
use crate::engine::tenant::TenantResolver;
use crate::error::{TabulaError, TabulaResult};
use crate::storage::{
    BackingStore, CacheKey, InvalidationContext, InvalidationStrategy, OperationKind, Params, Row,
    TenantCache, rows_path,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Cached row sets; single rows are cached as one-element sets.
pub type RowCache = TenantCache<Arc<Vec<Row>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Maximum rows to return, `None` for the whole table
    pub limit: Option<usize>,
    pub use_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            limit: None,
            use_cache: true,
        }
    }
}

impl ReadOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn uncached(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

pub struct DataAccess<S: BackingStore> {
    resolver: Arc<dyn TenantResolver>,
    batcher: Arc<BatchCoordinator<S>>,
    row_cache: Arc<RowCache>,
    strategy: Arc<InvalidationStrategy>,
    read_ttl: Duration,
    write_ttl: Duration,
}

fn rows_key(tenant: &str, table: &str, limit: Option<usize>) -> CacheKey {
    let mut params = Params::new();
    params.insert("limit".to_string(), json!(limit));
    CacheKey::new(tenant, rows_path(table), &params)
}

fn row_key(tenant: &str, table: &str, position: usize) -> CacheKey {
    let mut params = Params::new();
    params.insert("position".to_string(), json!(position));
    CacheKey::new(tenant, rows_path(table), &params)
}

fn unexpected(kind: &str, output: OpOutput) -> TabulaError {
    TabulaError::execution(format!("unexpected {kind} output: {output:?}"), "data access")
}

impl<S: BackingStore> DataAccess<S> {
    pub fn new(
        resolver: Arc<dyn TenantResolver>,
        batcher: Arc<BatchCoordinator<S>>,
        row_cache: Arc<RowCache>,
        strategy: Arc<InvalidationStrategy>,
        read_ttl: Duration,
        write_ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            batcher,
            row_cache,
            strategy,
            read_ttl,
            write_ttl,
        }
    }

    pub fn row_cache(&self) -> &Arc<RowCache> {
        &self.row_cache
    }

    pub fn batcher(&self) -> &Arc<BatchCoordinator<S>> {
        &self.batcher
    }

    /// Resolve `tenant` to its backing resource. Every read and write goes
    /// through here before touching a cache, so a disabled or removed tenant
    /// is refused even when its data is still cached.
    pub(crate) async fn resource_of(&self, tenant: &str) -> TabulaResult<String> {
        Ok(self.resolver.resolve(tenant).await?.resource_id)
    }

    /// Rows of `table` in positional order.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_rows(
        &self,
        tenant: &str,
        table: &str,
        options: ReadOptions,
    ) -> TabulaResult<Arc<Vec<Row>>> {
        let resource = self.resource_of(tenant).await?;
        let key = rows_key(tenant, table, options.limit);
        if options.use_cache
            && let Some(rows) = self.row_cache.get(&key)
        {
            debug!(%key, rows = rows.len(), "row cache hit");
            return Ok(rows);
        }

        let rows = match self
            .batcher
            .enqueue(tenant, &resource, Operation::read(table, options.limit))
            .await?
        {
            OpOutput::Rows(rows) => Arc::new(rows),
            other => return Err(unexpected("read", other)),
        };
        debug!(%key, rows = rows.len(), "row cache miss");

        if options.use_cache {
            self.row_cache
                .set_with_ttl(key, Arc::clone(&rows), self.read_ttl);
        }
        Ok(rows)
    }

    /// Single row by 1-based position.
    pub async fn get_row(&self, tenant: &str, table: &str, position: usize) -> TabulaResult<Option<Row>> {
        self.resource_of(tenant).await?;
        let key = row_key(tenant, table, position);
        if let Some(rows) = self.row_cache.get(&key) {
            return Ok(rows.first().cloned());
        }
        let rows = self.get_rows(tenant, table, ReadOptions::default()).await?;
        Ok(rows.iter().find(|row| row.position == Some(position)).cloned())
    }

    pub async fn add_row(&self, tenant: &str, table: &str, row: Row) -> TabulaResult<Row> {
        self.add_rows(tenant, table, vec![row])
            .await?
            .pop()
            .ok_or_else(|| TabulaError::execution("append returned no row", table))
    }

    /// Appends in order; returns the stored rows with their positions.
    #[instrument(skip(self, rows), fields(rows = rows.len()), level = "debug")]
    pub async fn add_rows(&self, tenant: &str, table: &str, rows: Vec<Row>) -> TabulaResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let resource = self.resource_of(tenant).await?;
        let stored = match self
            .batcher
            .enqueue(tenant, &resource, Operation::append(table, rows))
            .await?
        {
            OpOutput::Rows(rows) => rows,
            other => return Err(unexpected("append", other)),
        };
        self.strategy
            .table_changed(tenant, OperationKind::RowAdd, table);
        Ok(stored)
    }

    /// Overwrites the row at `row.position`.
    #[instrument(skip(self, row), fields(position = ?row.position), level = "debug")]
    pub async fn update_row(&self, tenant: &str, table: &str, row: Row) -> TabulaResult<Row> {
        let position = row.position.filter(|p| *p > 0).ok_or_else(|| {
            TabulaError::InvalidArguments("update_row needs a row with a position".to_string())
        })?;
        let resource = self.resource_of(tenant).await?;
        let updated = match self
            .batcher
            .enqueue(tenant, &resource, Operation::update(table, row))
            .await?
        {
            OpOutput::Row(row) => row,
            other => return Err(unexpected("update", other)),
        };
        self.strategy
            .table_changed(tenant, OperationKind::RowUpdate, table);
        self.row_cache.set_with_ttl(
            row_key(tenant, table, position),
            Arc::new(vec![updated.clone()]),
            self.write_ttl,
        );
        Ok(updated)
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete_row(&self, tenant: &str, table: &str, position: usize) -> TabulaResult<()> {
        if position == 0 {
            return Err(TabulaError::InvalidArguments(
                "row positions start at 1".to_string(),
            ));
        }
        let resource = self.resource_of(tenant).await?;
        match self
            .batcher
            .enqueue(tenant, &resource, Operation::delete(table, position))
            .await?
        {
            OpOutput::Deleted => {}
            other => return Err(unexpected("delete", other)),
        }
        self.strategy
            .table_changed(tenant, OperationKind::RowDelete, table);
        Ok(())
    }

    /// Drops every cached value of the tenant.
    pub fn invalidate_tenant(&self, tenant: &str) -> Vec<CacheKey> {
        self.strategy.on_mutation(
            tenant,
            OperationKind::TenantReset,
            &InvalidationContext::none(),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, PoolConfig, RateLimitConfig};
    use crate::engine::tenant::{StaticTenantRegistry, TenantInfo};
    use crate::pool::{ConnectionPool, RateLimiter};
    use crate::storage::{CacheInvalidator, MemoryStore, ScalarValue};

    fn facade(store: Arc<MemoryStore>) -> DataAccess<MemoryStore> {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let pool = ConnectionPool::new(store, PoolConfig::default(), limiter);
        let batcher = BatchCoordinator::new(pool, BatchConfig::disabled());
        let row_cache = Arc::new(RowCache::new("rows", Duration::from_secs(60)));
        let targets: Vec<Arc<dyn CacheInvalidator>> = vec![row_cache.clone()];
        let strategy = Arc::new(InvalidationStrategy::new(targets, 10));
        let resolver = Arc::new(StaticTenantRegistry::new().with_tenant("acme", TenantInfo::new("wb-acme")));
        DataAccess::new(
            resolver,
            batcher,
            row_cache,
            strategy,
            Duration::from_secs(120),
            Duration::from_secs(30),
        )
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            "wb-acme",
            "orders",
            vec![Row::new().with("id", 1), Row::new().with("id", 2)],
        );
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_cached_until_a_write() {
        let store = seeded();
        let access = facade(store.clone());

        let first = access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        let second = access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.calls().reads, 1);

        access
            .add_row("acme", "orders", Row::new().with("id", 3))
            .await
            .unwrap();
        let third = access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        assert_eq!(third.len(), 3);
        assert_eq!(store.calls().reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncached_read_bypasses_cache() {
        let store = seeded();
        let access = facade(store.clone());
        access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        access
            .get_rows("acme", "orders", ReadOptions::default().uncached())
            .await
            .unwrap();
        assert_eq!(store.calls().reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_writes_back_single_row() {
        let store = seeded();
        let access = facade(store.clone());
        let updated = access
            .update_row("acme", "orders", Row::new().with("id", 20).with_position(2))
            .await
            .unwrap();
        assert_eq!(updated.position, Some(2));

        let reads_before = store.calls().reads;
        let row = access.get_row("acme", "orders", 2).await.unwrap().unwrap();
        assert_eq!(row.get("id"), &ScalarValue::Int64(20));
        assert_eq!(store.calls().reads, reads_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_argument_and_tenant_errors() {
        let access = facade(seeded());
        assert!(matches!(
            access.update_row("acme", "orders", Row::new()).await,
            Err(TabulaError::InvalidArguments(_))
        ));
        assert!(matches!(
            access.delete_row("acme", "orders", 0).await,
            Err(TabulaError::InvalidArguments(_))
        ));
        assert!(matches!(
            access.get_rows("nobody", "orders", ReadOptions::default()).await,
            Err(TabulaError::TenantNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_invalidates() {
        let store = seeded();
        let access = facade(store.clone());
        access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        access.delete_row("acme", "orders", 1).await.unwrap();
        let rows = access.get_rows("acme", "orders", ReadOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), &ScalarValue::Int64(2));
    }
}
