//! Parsed query cache
//!
//! Query text is normalized, hashed to 64 bits and looked up in a bounded
//! LRU. A hit hands back the very same `Arc<Query>` without re-parsing.

use crate::error::TabulaResult;
use crate::sql::{Query, SqlParser, normalize};
use ahash::AHasher;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 1_000;

struct CachedPlan {
    /// Normalized text, compared on hit to rule out hash collisions
    text: String,
    query: Arc<Query>,
}

/// Bounded cache of parsed queries.
pub struct PlanCache {
    parser: SqlParser,
    inner: Mutex<LruCache<u64, CachedPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlanCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PlanCache {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            parser: SqlParser::new(),
            inner: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_PLAN_CACHE_CAPACITY)
    }

    /// Parse through the cache. Parse errors are not cached.
    pub fn parse(&self, sql: &str) -> TabulaResult<Arc<Query>> {
        let text = normalize(sql);
        let key = text_hash(&text);

        if let Some(plan) = self.inner.lock().get(&key)
            && plan.text == text
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "plan cache hit");
            return Ok(Arc::clone(&plan.query));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "plan cache miss");
        let query = Arc::new(self.parser.parse_query(&text)?);
        self.inner.lock().put(
            key,
            CachedPlan {
                text,
                query: Arc::clone(&query),
            },
        );
        Ok(query)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> PlanCacheStats {
        let inner = self.inner.lock();
        PlanCacheStats {
            entries: inner.len(),
            capacity: inner.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = AHasher::default();
    text.hash(&mut hasher);
    hasher.finish()
}
