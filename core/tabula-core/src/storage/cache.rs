//! Tenant Result Cache
//!
//! TTL cache keyed by (tenant, logical path, parameter fingerprint). Used
//! for fetched row sets and, as a separate instance, for segment results.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Request parameters folded into a cache key. Sorted, so the encoding is
/// deterministic regardless of insertion order.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Bytes of the SHA-256 digest kept in the fingerprint
const FINGERPRINT_BYTES: usize = 12;

/// Deterministic key: tenant + logical path + parameter fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub tenant: String,
    pub path: String,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(tenant: impl Into<String>, path: impl Into<String>, params: &Params) -> Self {
        Self {
            tenant: tenant.into(),
            path: path.into(),
            fingerprint: fingerprint(params),
        }
    }

    /// Key without parameters.
    pub fn bare(tenant: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(tenant, path, &Params::new())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.path, self.fingerprint)
    }
}

/// URL-safe digest of the canonical JSON encoding of `params`.
pub fn fingerprint(params: &Params) -> String {
    let canonical = serde_json::to_vec(params).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    URL_SAFE_NO_PAD.encode(&digest[..FINGERPRINT_BYTES])
}

/// Observable lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    Fresh,
    /// TTL elapsed but the entry has not been physically removed yet
    Stale,
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

/// Anything the invalidation strategy can evict from.
///
/// Implemented by every [`TenantCache`] so that one strategy can drive
/// caches holding different value types.
pub trait CacheInvalidator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Remove one key. Returns whether it was present.
    fn invalidate_key(&self, key: &CacheKey) -> bool;

    /// Remove every key of `tenant` under `path`, whatever its parameters.
    fn invalidate_path(&self, tenant: &str, path: &str) -> Vec<CacheKey>;

    /// Remove every key of `tenant`.
    fn invalidate_tenant(&self, tenant: &str) -> Vec<CacheKey>;

    /// Physically remove expired entries.
    fn sweep_expired(&self) -> Vec<CacheKey>;
}

/// TTL cache shared by all tenants; every key carries its tenant.
pub struct TenantCache<V> {
    name: String,
    entries: DashMap<CacheKey, CacheEntry<V>>,
    default_ttl: Duration,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl<V: Clone + Send + Sync> TenantCache<V> {
    /// Creates an empty cache whose `set` uses `default_ttl`.
    pub fn new(name: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            default_ttl,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Gets a fresh value. A stale entry counts as a miss and is removed.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(cache = %self.name, key = %key, "cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // Re-check under the shard write lock; a concurrent set may have refreshed it.
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(cache = %self.name, key = %key, expired, "cache miss");
        None
    }

    /// Inserts with the default TTL, overwriting unconditionally.
    pub fn set(&self, key: CacheKey, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: CacheKey, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Removes a key. Returns whether it was present (fresh or stale).
    pub fn delete(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state(key) == KeyState::Fresh
    }

    /// Lifecycle state without touching statistics or evicting.
    pub fn state(&self, key: &CacheKey) -> KeyState {
        match self.entries.get(key) {
            None => KeyState::Absent,
            Some(entry) if entry.is_expired(Instant::now()) => KeyState::Stale,
            Some(_) => KeyState::Fresh,
        }
    }

    /// Removes all keys of `tenant` under `path`.
    pub fn delete_path(&self, tenant: &str, path: &str) -> Vec<CacheKey> {
        self.remove_matching(|key| key.tenant == tenant && key.path == path)
    }

    /// Removes all keys of `tenant`.
    pub fn delete_tenant(&self, tenant: &str) -> Vec<CacheKey> {
        self.remove_matching(|key| key.tenant == tenant)
    }

    /// Removes every expired entry.
    pub fn purge_expired(&self) -> Vec<CacheKey> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.is_expired(now) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn remove_matching(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut removed = Vec::new();
        self.entries.retain(|key, _| {
            if predicate(key) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of physically held entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns cache hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed);
        let misses = self.miss_count.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Returns cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }

    /// Clears the cache
    pub fn clear(&self) {
        self.entries.clear();
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
    }
}

impl<V: Clone + Send + Sync> CacheInvalidator for TenantCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.delete(key)
    }

    fn invalidate_path(&self, tenant: &str, path: &str) -> Vec<CacheKey> {
        self.delete_path(tenant, path)
    }

    fn invalidate_tenant(&self, tenant: &str) -> Vec<CacheKey> {
        self.delete_tenant(tenant)
    }

    fn sweep_expired(&self) -> Vec<CacheKey> {
        self.purge_expired()
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
}
