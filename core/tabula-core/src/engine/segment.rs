//! Segment engine
//!
//! Executes queries against tenant tables and keeps stored segments (named
//! queries). Segment results are cached briefly and registered as dependents
//! of the table's rows, so any write to the table drops them.

use crate::engine::data_access::{DataAccess, ReadOptions};
use crate::engine::plan::{PlanCache, PlanCacheStats};
use crate::error::{TabulaError, TabulaResult};
use crate::sql::{Query, QueryExecutor, normalize};
use crate::storage::{
    BackingStore, CacheKey, InvalidationStrategy, Params, Row, TenantCache, table_source_key,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Named query owned by a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub name: String,
    pub query: String,
}

impl Segment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            query: query.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Upper bound on rows fetched from the table
    pub max_rows: Option<usize>,
    pub use_cache: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_rows: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Output column names in select-list order
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows fetched from the table
    pub total_rows: usize,
    /// Rows that passed WHERE
    pub filtered_rows: usize,
    pub execution_time: Duration,
}

pub type SegmentCache = TenantCache<Arc<QueryResult>>;

/// Logical cache path of a segment's results.
pub fn segment_path(segment_id: &str) -> String {
    format!("segments/{segment_id}")
}

pub struct QueryEngine<S: BackingStore> {
    plans: PlanCache,
    executor: QueryExecutor,
    access: Arc<DataAccess<S>>,
    segment_cache: Arc<SegmentCache>,
    strategy: Arc<InvalidationStrategy>,
    segment_ttl: Duration,
    /// (tenant, segment id) -> definition
    segments: DashMap<(String, String), Segment>,
}

impl<S: BackingStore> QueryEngine<S> {
    pub fn new(
        access: Arc<DataAccess<S>>,
        segment_cache: Arc<SegmentCache>,
        strategy: Arc<InvalidationStrategy>,
        parse_cache_capacity: usize,
        segment_ttl: Duration,
    ) -> Self {
        Self {
            plans: PlanCache::new(parse_cache_capacity),
            executor: QueryExecutor::new(),
            access,
            segment_cache,
            strategy,
            segment_ttl,
            segments: DashMap::new(),
        }
    }

    /// Parse through the plan cache.
    pub fn parse(&self, text: &str) -> TabulaResult<Arc<Query>> {
        self.plans.parse(text)
    }

    pub fn plan_stats(&self) -> PlanCacheStats {
        self.plans.stats()
    }

    pub fn segment_cache(&self) -> &Arc<SegmentCache> {
        &self.segment_cache
    }

    /// Fetch the query's table through the facade and run the query over it.
    pub async fn execute(
        &self,
        tenant: &str,
        query: &Query,
        options: ExecuteOptions,
    ) -> TabulaResult<QueryResult> {
        let started = Instant::now();
        let rows = self
            .access
            .get_rows(
                tenant,
                &query.table,
                ReadOptions {
                    limit: options.max_rows,
                    use_cache: options.use_cache,
                },
            )
            .await?;
        let output = self.executor.execute(query, rows)?;
        let execution_time = started.elapsed();
        debug!(
            tenant,
            table = %query.table,
            total = output.total_rows,
            filtered = output.filtered_rows,
            returned = output.rows.len(),
            ?execution_time,
            "query executed"
        );
        Ok(QueryResult {
            columns: output.columns,
            rows: output.rows,
            total_rows: output.total_rows,
            filtered_rows: output.filtered_rows,
            execution_time,
        })
    }

    pub async fn execute_sql(
        &self,
        tenant: &str,
        text: &str,
        options: ExecuteOptions,
    ) -> TabulaResult<QueryResult> {
        let query = self.parse(text)?;
        self.execute(tenant, &query, options).await
    }

    /// Run a segment definition, serving from the segment cache when allowed.
    pub async fn run_segment(
        &self,
        tenant: &str,
        segment: &Segment,
        options: ExecuteOptions,
    ) -> TabulaResult<Arc<QueryResult>> {
        self.access.resource_of(tenant).await?;
        let key = segment_key(tenant, segment, options.max_rows);
        if options.use_cache
            && let Some(result) = self.segment_cache.get(&key)
        {
            debug!(tenant, segment = %segment.id, "segment cache hit");
            return Ok(result);
        }

        let query = self.parse(&segment.query)?;
        let result = Arc::new(self.execute(tenant, &query, options).await?);
        if options.use_cache {
            self.segment_cache
                .set_with_ttl(key.clone(), Arc::clone(&result), self.segment_ttl);
            self.strategy
                .add_dependency(key, table_source_key(tenant, &query.table));
        }
        Ok(result)
    }

    /// Store (or replace) a segment. The query must parse.
    pub fn save_segment(&self, tenant: &str, segment: Segment) -> TabulaResult<()> {
        if segment.id.is_empty() {
            return Err(TabulaError::InvalidArguments(
                "segment id must not be empty".to_string(),
            ));
        }
        self.parse(&segment.query)?;
        self.drop_segment_results(tenant, &segment.id);
        self.segments
            .insert((tenant.to_string(), segment.id.clone()), segment);
        Ok(())
    }

    pub fn segment(&self, tenant: &str, segment_id: &str) -> Option<Segment> {
        self.segments
            .get(&(tenant.to_string(), segment_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Segments of a tenant, ordered by id.
    pub fn segments(&self, tenant: &str) -> Vec<Segment> {
        let mut out: Vec<Segment> = self
            .segments
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn delete_segment(&self, tenant: &str, segment_id: &str) -> Option<Segment> {
        let removed = self
            .segments
            .remove(&(tenant.to_string(), segment_id.to_string()))
            .map(|(_, segment)| segment);
        if removed.is_some() {
            self.drop_segment_results(tenant, segment_id);
        }
        removed
    }

    /// Run a stored segment by id.
    pub async fn run_stored_segment(
        &self,
        tenant: &str,
        segment_id: &str,
        options: ExecuteOptions,
    ) -> TabulaResult<Arc<QueryResult>> {
        let segment = self.segment(tenant, segment_id).ok_or_else(|| {
            TabulaError::InvalidArguments(format!("unknown segment '{segment_id}'"))
        })?;
        self.run_segment(tenant, &segment, options).await
    }

    fn drop_segment_results(&self, tenant: &str, segment_id: &str) {
        for key in self
            .segment_cache
            .delete_path(tenant, &segment_path(segment_id))
        {
            self.strategy.graph().remove_key(&key);
        }
    }
}

fn segment_key(tenant: &str, segment: &Segment, max_rows: Option<usize>) -> CacheKey {
    let mut params = Params::new();
    params.insert("max_rows".to_string(), json!(max_rows));
    params.insert("query".to_string(), json!(normalize(&segment.query)));
    CacheKey::new(tenant, segment_path(&segment.id), &params)
}
