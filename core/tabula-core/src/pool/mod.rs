//! Backing store connection pool.
//!
//! Bounded set of live handles keyed by (tenant, resource). Admission:
//!
//! 1. per-tenant sliding-window rate check (fails fast)
//! 2. reuse of the most recently used idle, non-expired entry for the key
//! 3. a new connection while fewer than `max_concurrent` are busy, evicting
//!    the least recently used idle entry when the pool is full
//! 4. otherwise a FIFO wait with a deadline
//!
//! All bookkeeping lives behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Waiters receive their grant through a oneshot channel.

pub mod rate_limit;

pub use rate_limit::{RateLimiter, Throttled};

use crate::config::PoolConfig;
use crate::error::{TabulaError, TabulaResult};
use crate::storage::BackingStore;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Pool occupancy and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub timeouts: u64,
}

struct PoolEntry<H> {
    handle: Arc<H>,
    tenant: String,
    resource_id: String,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
    use_count: u64,
    /// Destroyed on release instead of returning to the idle set
    retired: bool,
}

impl<H> PoolEntry<H> {
    fn matches(&self, tenant: &str, resource_id: &str) -> bool {
        self.tenant == tenant && self.resource_id == resource_id
    }
}

enum Admission<H> {
    Reuse { id: u64, handle: Arc<H> },
    /// A slot is reserved; the receiver opens the connection itself
    Create,
}

struct Waiter<H> {
    id: u64,
    tenant: String,
    resource_id: String,
    grant: oneshot::Sender<Admission<H>>,
}

struct PoolState<H> {
    entries: HashMap<u64, PoolEntry<H>>,
    waiters: VecDeque<Waiter<H>>,
    /// Busy entries plus reserved creation slots
    in_use: usize,
    /// Reserved slots whose connection is still being opened
    creating: usize,
    next_entry_id: u64,
    next_waiter_id: u64,
    created: u64,
    reused: u64,
    evicted: u64,
    timeouts: u64,
}

impl<H> PoolState<H> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            waiters: VecDeque::new(),
            in_use: 0,
            creating: 0,
            next_entry_id: 1,
            next_waiter_id: 1,
            created: 0,
            reused: 0,
            evicted: 0,
            timeouts: 0,
        }
    }
}

pub struct ConnectionPool<S: BackingStore> {
    store: Arc<S>,
    config: PoolConfig,
    limiter: Arc<RateLimiter>,
    state: Mutex<PoolState<S::Handle>>,
}

impl<S: BackingStore> ConnectionPool<S> {
    pub fn new(store: Arc<S>, config: PoolConfig, limiter: Arc<RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            limiter,
            state: Mutex::new(PoolState::new()),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Obtain a connection for (tenant, resource).
    pub async fn acquire(
        self: &Arc<Self>,
        tenant: &str,
        resource_id: &str,
    ) -> TabulaResult<PooledConnection<S>> {
        self.limiter
            .try_acquire(tenant)
            .map_err(|throttled| TabulaError::RateLimited {
                tenant: tenant.to_string(),
                retry_after: throttled.retry_after,
            })?;

        let started = Instant::now();
        let queued = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match self.try_admit(state, tenant, resource_id, started) {
                Some(admission) => Ok(admission),
                None => {
                    let (grant, receiver) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter {
                        id,
                        tenant: tenant.to_string(),
                        resource_id: resource_id.to_string(),
                        grant,
                    });
                    debug!(tenant, resource_id, waiting = state.waiters.len(), "pool exhausted, queued");
                    Err((id, receiver))
                }
            }
        };

        let admission = match queued {
            Ok(admission) => admission,
            Err((waiter_id, receiver)) => {
                self.wait_for_grant(tenant, resource_id, waiter_id, receiver, started)
                    .await?
            }
        };

        match admission {
            Admission::Reuse { id, handle } => {
                debug!(tenant, resource_id, entry = id, "reusing pooled connection");
                Ok(PooledConnection::new(self.clone(), id, handle, tenant, resource_id))
            }
            Admission::Create => self.open(tenant, resource_id).await,
        }
    }

    async fn wait_for_grant(
        &self,
        tenant: &str,
        resource_id: &str,
        waiter_id: u64,
        mut receiver: oneshot::Receiver<Admission<S::Handle>>,
        started: Instant,
    ) -> TabulaResult<Admission<S::Handle>> {
        match tokio::time::timeout(self.config.acquire_timeout(), &mut receiver).await {
            Ok(Ok(admission)) => Ok(admission),
            Ok(Err(_)) => Err(TabulaError::Shutdown("connection pool".to_string())),
            Err(_) => {
                let cancelled = {
                    let mut state = self.state.lock();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != waiter_id);
                    let cancelled = state.waiters.len() < before;
                    if cancelled {
                        state.timeouts += 1;
                    }
                    cancelled
                };
                if !cancelled {
                    // Granted between the deadline and the cancellation.
                    if let Ok(admission) = receiver.try_recv() {
                        return Ok(admission);
                    }
                }
                let waited = started.elapsed();
                warn!(tenant, resource_id, ?waited, "pool acquire timed out");
                Err(TabulaError::PoolTimeout {
                    tenant: tenant.to_string(),
                    resource: resource_id.to_string(),
                    waited,
                })
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        tenant: &str,
        resource_id: &str,
    ) -> TabulaResult<PooledConnection<S>> {
        let mut slot = ReservedSlot {
            pool: self.as_ref(),
            armed: true,
        };
        let handle = Arc::new(self.store.connect(tenant, resource_id).await?);
        slot.armed = false;

        let now = Instant::now();
        let id = {
            let mut state = self.state.lock();
            state.creating -= 1;
            state.created += 1;
            let id = state.next_entry_id;
            state.next_entry_id += 1;
            state.entries.insert(
                id,
                PoolEntry {
                    handle: handle.clone(),
                    tenant: tenant.to_string(),
                    resource_id: resource_id.to_string(),
                    created_at: now,
                    last_used_at: now,
                    in_use: true,
                    use_count: 1,
                    retired: false,
                },
            );
            id
        };
        debug!(tenant, resource_id, entry = id, "opened connection");
        Ok(PooledConnection::new(self.clone(), id, handle, tenant, resource_id))
    }

    fn try_admit(
        &self,
        state: &mut PoolState<S::Handle>,
        tenant: &str,
        resource_id: &str,
        now: Instant,
    ) -> Option<Admission<S::Handle>> {
        if let Some(admission) = self.take_idle(state, tenant, resource_id, now) {
            return Some(admission);
        }
        // Queued callers go first.
        if !state.waiters.is_empty() {
            return None;
        }
        self.reserve_slot(state).then_some(Admission::Create)
    }

    fn take_idle(
        &self,
        state: &mut PoolState<S::Handle>,
        tenant: &str,
        resource_id: &str,
        now: Instant,
    ) -> Option<Admission<S::Handle>> {
        if state.in_use >= self.config.max_concurrent {
            return None;
        }
        let idle_ttl = self.config.idle_ttl();
        let (&id, entry) = state
            .entries
            .iter_mut()
            .filter(|(_, e)| !e.in_use && !e.retired && e.matches(tenant, resource_id))
            .filter(|(_, e)| now.saturating_duration_since(e.last_used_at) < idle_ttl)
            .max_by_key(|(_, e)| e.last_used_at)?;

        entry.in_use = true;
        entry.use_count += 1;
        entry.last_used_at = now;
        let handle = entry.handle.clone();
        state.in_use += 1;
        state.reused += 1;
        Some(Admission::Reuse { id, handle })
    }

    /// Reserve a creation slot, evicting the LRU idle entry if the pool is full.
    fn reserve_slot(&self, state: &mut PoolState<S::Handle>) -> bool {
        if state.in_use >= self.config.max_concurrent {
            return false;
        }
        if state.entries.len() + state.creating >= self.config.max_pool_size {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(&id, _)| id);
            match victim {
                Some(id) => {
                    if let Some(entry) = state.entries.remove(&id) {
                        debug!(
                            tenant = %entry.tenant,
                            resource_id = %entry.resource_id,
                            uses = entry.use_count,
                            age = ?entry.created_at.elapsed(),
                            "evicting idle connection"
                        );
                    }
                    state.evicted += 1;
                }
                None => return false,
            }
        }
        state.in_use += 1;
        state.creating += 1;
        true
    }

    /// Hand freed capacity to queued callers in FIFO order.
    fn serve_waiters(&self, state: &mut PoolState<S::Handle>) {
        let now = Instant::now();
        loop {
            let Some(front) = state.waiters.front() else {
                break;
            };
            let (tenant, resource_id) = (front.tenant.clone(), front.resource_id.clone());
            let admission = match self.take_idle(state, &tenant, &resource_id, now) {
                Some(admission) => admission,
                None if self.reserve_slot(state) => Admission::Create,
                None => break,
            };
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if let Err(admission) = waiter.grant.send(admission) {
                // Caller went away; give the capacity back and try the next one.
                Self::undo(state, admission);
            }
        }
    }

    fn undo(state: &mut PoolState<S::Handle>, admission: Admission<S::Handle>) {
        match admission {
            Admission::Reuse { id, .. } => {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.in_use = false;
                }
                state.reused = state.reused.saturating_sub(1);
            }
            Admission::Create => state.creating -= 1,
        }
        state.in_use -= 1;
    }

    fn release(&self, id: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let retired = match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                entry.retired
            }
            None => return,
        };
        if retired {
            state.entries.remove(&id);
        }
        state.in_use -= 1;
        self.serve_waiters(state);
    }

    fn release_slot(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_use -= 1;
        state.creating -= 1;
        self.serve_waiters(state);
    }

    /// Destroy idle entries unused for longer than the idle TTL.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.config.idle_ttl();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| e.in_use || now.saturating_duration_since(e.last_used_at) < idle_ttl);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(removed, "swept idle connections");
        }
        removed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until the
    /// pool is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.sweep_idle();
            }
        })
    }

    /// Drop every connection of `tenant`. Busy ones are destroyed when released.
    pub fn reset_tenant(&self, tenant: &str) -> usize {
        let mut state = self.state.lock();
        let mut affected = 0;
        state.entries.retain(|_, e| {
            if e.tenant != tenant {
                return true;
            }
            affected += 1;
            if e.in_use {
                e.retired = true;
                true
            } else {
                false
            }
        });
        debug!(tenant, affected, "reset tenant connections");
        affected
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let idle = state.entries.values().filter(|e| !e.in_use).count();
        PoolStats {
            total: state.entries.len(),
            in_use: state.in_use,
            idle,
            waiting: state.waiters.len(),
            created: state.created,
            reused: state.reused,
            evicted: state.evicted,
            timeouts: state.timeouts,
        }
    }
}

/// Gives a reserved creation slot back if `connect` fails or the caller is cancelled.
struct ReservedSlot<'a, S: BackingStore> {
    pool: &'a ConnectionPool<S>,
    armed: bool,
}

impl<S: BackingStore> Drop for ReservedSlot<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection<S: BackingStore> {
    pool: Arc<ConnectionPool<S>>,
    id: u64,
    handle: Arc<S::Handle>,
    tenant: String,
    resource_id: String,
    acquired_at: Instant,
}

impl<S: BackingStore> std::fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("resource_id", &self.resource_id)
            .finish_non_exhaustive()
    }
}

impl<S: BackingStore> PooledConnection<S> {
    fn new(
        pool: Arc<ConnectionPool<S>>,
        id: u64,
        handle: Arc<S::Handle>,
        tenant: &str,
        resource_id: &str,
    ) -> Self {
        Self {
            pool,
            id,
            handle,
            tenant: tenant.to_string(),
            resource_id: resource_id.to_string(),
            acquired_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> &S::Handle {
        &self.handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Time since checkout.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Return the connection now. Same as dropping it.
    pub fn release(self) {}
}

impl<S: BackingStore> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::storage::MemoryStore;

    fn pool_with(max_pool_size: usize, max_concurrent: usize) -> Arc<ConnectionPool<MemoryStore>> {
        let config = PoolConfig {
            max_pool_size,
            max_concurrent,
            acquire_timeout_ms: 1_000,
            ..PoolConfig::default()
        };
        ConnectionPool::new(
            Arc::new(MemoryStore::new()),
            config,
            Arc::new(RateLimiter::new(&RateLimitConfig {
                max_requests: 1_000,
                window_ms: 60_000,
            })),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_then_reuse() {
        let pool = pool_with(4, 4);
        let first = pool.acquire("acme", "book-1").await.unwrap();
        let first_id = first.id();
        first.release();

        let second = pool.acquire("acme", "book-1").await.unwrap();
        assert_eq!(second.id(), first_id);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(pool.store().calls().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_idle_entry_is_evicted_when_full() {
        let pool = pool_with(2, 2);
        let a = pool.acquire("acme", "a").await.unwrap();
        drop(a);
        tokio::time::advance(Duration::from_millis(10)).await;
        let b = pool.acquire("acme", "b").await.unwrap();
        drop(b);

        let _c = pool.acquire("acme", "c").await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.evicted, 1);

        // "b" survived, "a" was the least recently used.
        let b_again = pool.acquire("acme", "b").await.unwrap();
        assert_eq!(b_again.resource_id(), "b");
        assert_eq!(pool.stats().reused, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_frees_slot() {
        let pool = pool_with(1, 1);
        pool.store().fail_connect("broken");

        assert!(pool.acquire("acme", "broken").await.is_err());
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total, 0);

        assert!(pool.acquire("acme", "ok").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep() {
        let pool = pool_with(4, 4);
        drop(pool.acquire("acme", "a").await.unwrap());
        let _busy = pool.acquire("acme", "b").await.unwrap();

        tokio::time::advance(pool.config().idle_ttl() + Duration::from_secs(1)).await;
        assert_eq!(pool.sweep_idle(), 1);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_tenant_retires_busy_entries() {
        let pool = pool_with(4, 4);
        drop(pool.acquire("acme", "a").await.unwrap());
        let busy = pool.acquire("acme", "b").await.unwrap();
        let _other = pool.acquire("globex", "a").await.unwrap();

        assert_eq!(pool.reset_tenant("acme"), 2);
        assert_eq!(pool.stats().total, 2);
        drop(busy);
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited() {
        let pool = ConnectionPool::new(
            Arc::new(MemoryStore::new()),
            PoolConfig::default(),
            Arc::new(RateLimiter::with_limits(1, Duration::from_secs(60))),
        );
        drop(pool.acquire("acme", "a").await.unwrap());
        let err = pool.acquire("acme", "a").await.unwrap_err();
        assert!(matches!(err, TabulaError::RateLimited { .. }));
        assert!(err.is_retryable());
    }
}
