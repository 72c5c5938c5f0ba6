//! Per-tenant sliding-window rate limiter.
//!
//! Each tenant keeps the instants of its admitted requests; instants older
//! than the window are pruned on every check. Tenants whose window has
//! emptied are dropped, at most once per window span during admissions.

use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a rejected check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    /// Time until the oldest admission leaves the window
    pub retry_after: Duration,
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    windows: HashMap<String, VecDeque<Instant>>,
    last_sweep: Option<Instant>,
}

impl WindowState {
    fn sweep(&mut self, now: Instant, span: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            prune(window, now, span);
            !window.is_empty()
        });
        self.last_sweep = Some(now);
        before - self.windows.len()
    }
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_limits(config.max_requests, config.window())
    }

    pub fn with_limits(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Admit one request for `tenant` if the window has room.
    pub fn try_acquire(&self, tenant: &str) -> Result<(), Throttled> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let due = state
            .last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= self.window);
        if due {
            state.sweep(now, self.window);
        }
        let window = state.windows.entry(tenant.to_string()).or_default();
        prune(window, now, self.window);

        if window.len() < self.max_requests {
            window.push_back(now);
            return Ok(());
        }

        let retry_after = window
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(self.window);
        tracing::debug!(tenant, ?retry_after, "rate limit reached");
        Err(Throttled { retry_after })
    }

    /// Admissions left in the current window.
    pub fn remaining(&self, tenant: &str) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(window) = state.windows.get_mut(tenant) else {
            return self.max_requests;
        };
        prune(window, now, self.window);
        let used = window.len();
        if used == 0 {
            state.windows.remove(tenant);
        }
        self.max_requests.saturating_sub(used)
    }

    /// Forget the tenant's history.
    pub fn reset(&self, tenant: &str) {
        self.state.lock().windows.remove(tenant);
    }

    /// Drop every tenant with no admissions left in the window. Returns how
    /// many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        self.state.lock().sweep(now, self.window)
    }

    /// Tenants currently holding a window.
    pub fn tracked_tenants(&self) -> usize {
        self.state.lock().windows.len()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
