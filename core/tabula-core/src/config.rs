//! Runtime configuration.
//!
//! Every knob has a default and can be overridden from `TABULA_*`
//! environment variables or a JSON document.

use crate::error::{TabulaError, TabulaResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TABULA_";

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live handles (idle + busy) across all tenants.
    pub max_pool_size: usize,
    /// Maximum number of handles in use at the same time.
    pub max_concurrent: usize,
    /// Idle handles older than this are destroyed.
    pub idle_ttl_ms: u64,
    /// How long a queued acquisition waits before failing.
    pub acquire_timeout_ms: u64,
    /// Interval of the background idle sweep.
    pub sweep_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 50,
            max_concurrent: 10,
            idle_ttl_ms: 5 * 60 * 1000,
            acquire_timeout_ms: 30_000,
            sweep_interval_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Per-tenant sliding window limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per window.
    pub max_requests: usize,
    /// Window width in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Remote stores typically allow ~60 read requests per user per minute.
        Self {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Configuration for operation batching behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of operations per batch.
    pub max_batch_size: usize,
    /// Quiet period after the last enqueue before a batch flushes.
    pub debounce_ms: u64,
    /// Upper bound on how long a batch stays open under continuous traffic.
    pub max_wait_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            debounce_ms: 50,
            max_wait_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Disable batching entirely (every operation flushes on its own).
    pub fn disabled() -> Self {
        Self {
            max_batch_size: 1,
            debounce_ms: 0,
            max_wait_ms: 0,
        }
    }
}

/// Cache lifetimes and bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_ms: u64,
    /// TTL of fetched row sets.
    pub read_ttl_ms: u64,
    /// TTL of values written back right after a mutation.
    pub write_ttl_ms: u64,
    /// TTL of segment (query) results; these are more volatile.
    pub segment_ttl_ms: u64,
    /// Number of parsed queries kept in the parse cache.
    pub parse_cache_capacity: usize,
    /// Hard bound on cascade invalidation depth.
    pub cascade_max_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5 * 60 * 1000,
            read_ttl_ms: 2 * 60 * 1000,
            write_ttl_ms: 30_000,
            segment_ttl_ms: 60_000,
            parse_cache_capacity: 1_000,
            cascade_max_depth: 10,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn read_ttl(&self) -> Duration {
        Duration::from_millis(self.read_ttl_ms)
    }

    pub fn write_ttl(&self) -> Duration {
        Duration::from_millis(self.write_ttl_ms)
    }

    pub fn segment_ttl(&self) -> Duration {
        Duration::from_millis(self.segment_ttl_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
}

impl TabulaConfig {
    /// Defaults overridden by `TABULA_*` environment variables.
    pub fn from_env() -> TabulaResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// recognized `TABULA_*` key.
    pub fn from_lookup<F>(lookup: F) -> TabulaResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        override_with(&mut config.pool.max_pool_size, get("MAX_POOL_SIZE"))?;
        override_with(
            &mut config.pool.max_concurrent,
            get("MAX_CONCURRENT_CONNECTIONS"),
        )?;
        override_with(&mut config.pool.idle_ttl_ms, get("CONNECTION_IDLE_TTL_MS"))?;
        override_with(
            &mut config.pool.acquire_timeout_ms,
            get("POOL_ACQUIRE_TIMEOUT_MS"),
        )?;
        override_with(
            &mut config.pool.sweep_interval_ms,
            get("POOL_SWEEP_INTERVAL_MS"),
        )?;
        override_with(
            &mut config.rate_limit.max_requests,
            get("RATE_LIMIT_MAX_REQUESTS"),
        )?;
        override_with(&mut config.rate_limit.window_ms, get("RATE_LIMIT_WINDOW_MS"))?;
        override_with(&mut config.batch.debounce_ms, get("BATCH_DEBOUNCE_MS"))?;
        override_with(&mut config.batch.max_batch_size, get("BATCH_MAX_SIZE"))?;
        override_with(&mut config.batch.max_wait_ms, get("BATCH_MAX_WAIT_MS"))?;
        override_with(&mut config.cache.default_ttl_ms, get("CACHE_DEFAULT_TTL_MS"))?;
        override_with(&mut config.cache.read_ttl_ms, get("CACHE_READ_TTL_MS"))?;
        override_with(&mut config.cache.write_ttl_ms, get("CACHE_WRITE_TTL_MS"))?;
        override_with(&mut config.cache.segment_ttl_ms, get("SEGMENT_CACHE_TTL_MS"))?;
        override_with(
            &mut config.cache.parse_cache_capacity,
            get("PARSE_CACHE_CAPACITY"),
        )?;
        override_with(&mut config.cache.cascade_max_depth, get("CASCADE_MAX_DEPTH"))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing sections keep their defaults.
    pub fn from_json_str(json: &str) -> TabulaResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> TabulaResult<()> {
        non_zero("pool.max_pool_size", self.pool.max_pool_size as u64)?;
        non_zero("pool.max_concurrent", self.pool.max_concurrent as u64)?;
        non_zero("pool.idle_ttl_ms", self.pool.idle_ttl_ms)?;
        non_zero("pool.sweep_interval_ms", self.pool.sweep_interval_ms)?;
        non_zero("rate_limit.max_requests", self.rate_limit.max_requests as u64)?;
        non_zero("rate_limit.window_ms", self.rate_limit.window_ms)?;
        non_zero("batch.max_batch_size", self.batch.max_batch_size as u64)?;
        non_zero("cache.parse_cache_capacity", self.cache.parse_cache_capacity as u64)?;
        non_zero("cache.cascade_max_depth", self.cache.cascade_max_depth as u64)?;

        if self.batch.max_wait_ms < self.batch.debounce_ms {
            return Err(TabulaError::Config {
                key: "batch.max_wait_ms".to_string(),
                message: format!(
                    "must be >= debounce_ms ({} < {})",
                    self.batch.max_wait_ms, self.batch.debounce_ms
                ),
            });
        }
        Ok(())
    }
}

fn override_with<T>(slot: &mut T, entry: Option<(String, String)>) -> TabulaResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some((key, raw)) = entry {
        *slot = raw.trim().parse::<T>().map_err(|e| TabulaError::Config {
            key,
            message: format!("invalid value '{raw}': {e}"),
        })?;
    }
    Ok(())
}

fn non_zero(key: &str, value: u64) -> TabulaResult<()> {
    if value == 0 {
        return Err(TabulaError::Config {
            key: key.to_string(),
            message: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = TabulaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.segment_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = TabulaConfig::from_lookup(lookup_from(&[
            ("TABULA_MAX_POOL_SIZE", "8"),
            ("TABULA_MAX_CONCURRENT_CONNECTIONS", " 2 "),
            ("TABULA_RATE_LIMIT_WINDOW_MS", "1000"),
            ("TABULA_BATCH_MAX_SIZE", "25"),
        ]))
        .unwrap();

        assert_eq!(config.pool.max_pool_size, 8);
        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(1));
        assert_eq!(config.batch.max_batch_size, 25);
        // untouched keys keep defaults
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn invalid_value_names_the_key() {
        let err = TabulaConfig::from_lookup(lookup_from(&[("TABULA_BATCH_DEBOUNCE_MS", "soon")]))
            .unwrap_err();
        match err {
            TabulaError::Config { key, .. } => assert_eq!(key, "TABULA_BATCH_DEBOUNCE_MS"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = TabulaConfig::from_lookup(lookup_from(&[("TABULA_MAX_POOL_SIZE", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("pool.max_pool_size"));
    }

    #[test]
    fn max_wait_must_cover_debounce() {
        let mut config = TabulaConfig::default();
        config.batch.debounce_ms = 100;
        config.batch.max_wait_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_sections_are_optional() {
        let config = TabulaConfig::from_json_str(r#"{"pool": {"max_concurrent": 3}}"#).unwrap();
        assert_eq!(config.pool.max_concurrent, 3);
        assert_eq!(config.pool.max_pool_size, PoolConfig::default().max_pool_size);
        assert_eq!(config.batch, BatchConfig::default());
    }

    #[test]
    fn disabled_batching_is_valid() {
        let mut config = TabulaConfig::default();
        config.batch = BatchConfig::disabled();
        assert!(config.validate().is_ok());
    }
}
