// Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use tabula_core::config::{BatchConfig, PoolConfig, RateLimitConfig};
use tabula_core::pool::{ConnectionPool, RateLimiter};
use tabula_core::{MemoryStore, Platform, Row, StaticTenantRegistry, TabulaConfig, TenantInfo};

pub const TENANT: &str = "acme";
pub const RESOURCE: &str = "wb-acme";

/// (campaign, total) for the ten-row `orders` table
pub const ORDERS: [(&str, i64); 10] = [
    ("spring", 150),
    ("summer", 120),
    ("spring", 200),
    ("fall", 110),
    ("summer", 50),
    ("spring", 90),
    ("fall", 80),
    ("summer", 180),
    ("spring", 300),
    ("fall", 60),
];

pub fn orders() -> Vec<Row> {
    ORDERS
        .iter()
        .enumerate()
        .map(|(i, (campaign, total))| {
            Row::new()
                .with("id", i as i64 + 1)
                .with("campaign", *campaign)
                .with("total", *total)
                .with_position(i + 1)
        })
        .collect()
}

pub fn tenants() -> Arc<StaticTenantRegistry> {
    Arc::new(StaticTenantRegistry::new().with_tenant(TENANT, TenantInfo::new(RESOURCE)))
}

/// Config with batching turned off so every call flushes immediately.
pub fn unbatched_config() -> TabulaConfig {
    TabulaConfig {
        batch: BatchConfig::disabled(),
        ..TabulaConfig::default()
    }
}

pub fn platform_with(config: TabulaConfig) -> (Arc<MemoryStore>, Platform<MemoryStore>) {
    let (store, _, platform) = platform_with_registry(config);
    (store, platform)
}

/// Like `platform_with`, also handing back the registry so tests can
/// disable or drop the tenant.
pub fn platform_with_registry(
    config: TabulaConfig,
) -> (Arc<MemoryStore>, Arc<StaticTenantRegistry>, Platform<MemoryStore>) {
    tabula_core::logging::init_test();
    let store = Arc::new(MemoryStore::new());
    store.seed(RESOURCE, "orders", orders());
    let registry = tenants();
    let platform = Platform::new(config, store.clone(), registry.clone()).unwrap();
    (store, registry, platform)
}

pub fn pool(pool: PoolConfig, rate_limit: RateLimitConfig) -> Arc<ConnectionPool<MemoryStore>> {
    ConnectionPool::new(
        Arc::new(MemoryStore::new()),
        pool,
        Arc::new(RateLimiter::new(&rate_limit)),
    )
}

pub fn generous_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        max_requests: 10_000,
        window_ms: 60_000,
    }
}
