//! Service container
//!
//! Every core service is built once here and handed out by `Arc`. There are
//! no process-wide singletons: two platforms in one process are fully
//! independent.

use crate::batch::{BatchCoordinator, BatchStats};
use crate::config::TabulaConfig;
use crate::engine::data_access::{DataAccess, RowCache};
use crate::engine::segment::{ExecuteOptions, QueryEngine, QueryResult, Segment, SegmentCache};
use crate::engine::tenant::TenantResolver;
use crate::error::TabulaResult;
use crate::pool::{ConnectionPool, PoolStats, RateLimiter};
use crate::storage::{BackingStore, CacheInvalidator, CacheStats, InvalidationStrategy};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

/// Point-in-time view over all services.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformStats {
    pub pool: PoolStats,
    pub batch: BatchStats,
    pub row_cache: CacheStats,
    pub segment_cache: CacheStats,
    pub dependencies: usize,
}

pub struct Platform<S: BackingStore> {
    config: TabulaConfig,
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    pool: Arc<ConnectionPool<S>>,
    batcher: Arc<BatchCoordinator<S>>,
    row_cache: Arc<RowCache>,
    segment_cache: Arc<SegmentCache>,
    strategy: Arc<InvalidationStrategy>,
    data: Arc<DataAccess<S>>,
    queries: Arc<QueryEngine<S>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: BackingStore> Platform<S> {
    /// Validates `config` and wires every service.
    #[instrument(skip_all)]
    pub fn new(
        config: TabulaConfig,
        store: Arc<S>,
        tenants: Arc<dyn TenantResolver>,
    ) -> TabulaResult<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let pool = ConnectionPool::new(Arc::clone(&store), config.pool.clone(), Arc::clone(&limiter));
        let batcher = BatchCoordinator::new(Arc::clone(&pool), config.batch.clone());

        let row_cache = Arc::new(RowCache::new("rows", config.cache.default_ttl()));
        let segment_cache = Arc::new(SegmentCache::new("segments", config.cache.segment_ttl()));
        let targets: Vec<Arc<dyn CacheInvalidator>> = vec![row_cache.clone(), segment_cache.clone()];
        let strategy = Arc::new(InvalidationStrategy::new(
            targets,
            config.cache.cascade_max_depth,
        ));

        let data = Arc::new(DataAccess::new(
            tenants,
            Arc::clone(&batcher),
            Arc::clone(&row_cache),
            Arc::clone(&strategy),
            config.cache.read_ttl(),
            config.cache.write_ttl(),
        ));
        let queries = Arc::new(QueryEngine::new(
            Arc::clone(&data),
            Arc::clone(&segment_cache),
            Arc::clone(&strategy),
            config.cache.parse_cache_capacity,
            config.cache.segment_ttl(),
        ));

        info!(
            max_pool_size = config.pool.max_pool_size,
            max_concurrent = config.pool.max_concurrent,
            rate_limit = config.rate_limit.max_requests,
            batch_size = config.batch.max_batch_size,
            "platform initialized"
        );

        Ok(Self {
            config,
            store,
            limiter,
            pool,
            batcher,
            row_cache,
            segment_cache,
            strategy,
            data,
            queries,
            maintenance: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &TabulaConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<S>> {
        &self.pool
    }

    pub fn batcher(&self) -> &Arc<BatchCoordinator<S>> {
        &self.batcher
    }

    pub fn row_cache(&self) -> &Arc<RowCache> {
        &self.row_cache
    }

    pub fn segment_cache(&self) -> &Arc<SegmentCache> {
        &self.segment_cache
    }

    pub fn invalidation(&self) -> &Arc<InvalidationStrategy> {
        &self.strategy
    }

    pub fn data(&self) -> &Arc<DataAccess<S>> {
        &self.data
    }

    pub fn queries(&self) -> &Arc<QueryEngine<S>> {
        &self.queries
    }

    /// Spawns the pool idle sweeper and the expired-cache sweep. Must be
    /// called inside a Tokio runtime; calling it twice is a no-op.
    pub fn start_maintenance(&self) {
        let mut tasks = self.maintenance.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.pool.spawn_sweeper());

        let strategy: Weak<InvalidationStrategy> = Arc::downgrade(&self.strategy);
        let period = self.config.pool.sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(strategy) = strategy.upgrade() else {
                    break;
                };
                let removed = strategy.sweep();
                if !removed.is_empty() {
                    debug!(removed = removed.len(), "swept expired cache entries");
                }
            }
        }));
        info!(?period, "maintenance tasks started");
    }

    pub fn stop_maintenance(&self) {
        for task in self.maintenance.lock().drain(..) {
            task.abort();
        }
    }

    /// Flushes pending batches and stops background tasks.
    pub async fn shutdown(&self) {
        self.batcher.flush_all().await;
        self.stop_maintenance();
        info!("platform shut down");
    }

    /// Drops a tenant's cached values and pooled connections.
    pub fn reset_tenant(&self, tenant: &str) {
        let keys = self.data.invalidate_tenant(tenant);
        let connections = self.pool.reset_tenant(tenant);
        info!(tenant, keys = keys.len(), connections, "tenant reset");
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            pool: self.pool.stats(),
            batch: self.batcher.stats(),
            row_cache: self.row_cache.stats(),
            segment_cache: self.segment_cache.stats(),
            dependencies: self.strategy.graph().len(),
        }
    }

    pub async fn query(
        &self,
        tenant: &str,
        text: &str,
        options: ExecuteOptions,
    ) -> TabulaResult<QueryResult> {
        self.queries.execute_sql(tenant, text, options).await
    }

    pub fn save_segment(&self, tenant: &str, segment: Segment) -> TabulaResult<()> {
        self.queries.save_segment(tenant, segment)
    }

    pub async fn segment(
        &self,
        tenant: &str,
        segment_id: &str,
        options: ExecuteOptions,
    ) -> TabulaResult<Arc<QueryResult>> {
        self.queries
            .run_stored_segment(tenant, segment_id, options)
            .await
    }
}

impl<S: BackingStore> Drop for Platform<S> {
    fn drop(&mut self) {
        self.stop_maintenance();
    }
}
