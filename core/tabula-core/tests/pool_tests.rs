// Connection pool: waiter hand-off, deadlines and rate limiting.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tabula_core::TabulaError;
use tabula_core::config::{PoolConfig, RateLimitConfig};

fn single_slot() -> PoolConfig {
    PoolConfig {
        max_pool_size: 1,
        max_concurrent: 1,
        acquire_timeout_ms: 1_000,
        ..PoolConfig::default()
    }
}

/// Let spawned tasks run until they park on the pool.
async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn waiter_receives_released_connection() {
    let pool = pool(single_slot(), generous_rate_limit());
    let held = pool.acquire("acme", "wb-1").await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire("acme", "wb-1").await.map(|c| c.id()) })
    };
    settle().await;
    assert_eq!(pool.stats().waiting, 1);

    tokio::time::advance(Duration::from_millis(200)).await;
    held.release();

    let granted = waiter.await.unwrap().unwrap();
    assert_eq!(granted, held_id);
    let stats = pool.stats();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn waiter_times_out() {
    let pool = pool(single_slot(), generous_rate_limit());
    let _held = pool.acquire("acme", "wb-1").await.unwrap();

    let err = pool.acquire("acme", "wb-1").await.unwrap_err();
    match err {
        TabulaError::PoolTimeout { waited, .. } => assert!(waited >= Duration::from_millis(1_000)),
        other => panic!("expected PoolTimeout, got {other:?}"),
    }
    let stats = pool.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.in_use, 1);
}

#[tokio::test(start_paused = true)]
async fn waiter_for_other_resource_evicts_idle_entry() {
    let pool = pool(single_slot(), generous_rate_limit());
    let held = pool.acquire("acme", "wb-1").await.unwrap();
    let held_id = held.id();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let conn = pool.acquire("globex", "wb-2").await?;
            Ok::<_, TabulaError>((conn.id(), conn.resource_id().to_string()))
        })
    };
    settle().await;
    held.release();

    let (id, resource) = waiter.await.unwrap().unwrap();
    assert_ne!(id, held_id);
    assert_eq!(resource, "wb-2");

    let stats = pool.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.created, 2);
    assert_eq!(pool.store().calls().connects, 2);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_order() {
    let pool = pool(single_slot(), generous_rate_limit());
    let held = pool.acquire("acme", "wb-1").await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for n in 0..3 {
        let pool = Arc::clone(&pool);
        let tx = tx.clone();
        tokio::spawn(async move {
            let conn = pool.acquire("acme", "wb-1").await.unwrap();
            tx.send(n).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            conn.release();
        });
        settle().await;
    }
    drop(tx);
    held.release();

    let mut order = Vec::new();
    while let Some(n) = rx.recv().await {
        order.push(n);
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_window_slides() {
    let limits = RateLimitConfig {
        max_requests: 3,
        window_ms: 1_000,
    };
    let pool = pool(PoolConfig::default(), limits);

    for _ in 0..3 {
        pool.acquire("acme", "wb-1").await.unwrap().release();
    }
    let err = pool.acquire("acme", "wb-1").await.unwrap_err();
    match err {
        TabulaError::RateLimited { retry_after, .. } => {
            assert!(retry_after <= Duration::from_millis(1_000))
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // Other tenants have their own window.
    assert!(pool.acquire("globex", "wb-2").await.is_ok());

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(pool.acquire("acme", "wb-1").await.is_ok());
}
