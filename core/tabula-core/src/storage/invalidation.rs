//! Cache invalidation strategy
//!
//! Decides which cache entries a mutation makes stale. Each
//! [`OperationKind`] maps to one [`InvalidationRule`]; after the rule runs,
//! dependents registered in the [`DependencyGraph`] are removed transitively.
//! Invalidation never fails the mutation that triggered it: rule errors are
//! logged and swallowed.

use crate::error::{TabulaError, TabulaResult};
use crate::storage::cache::{CacheInvalidator, CacheKey};
use crate::storage::dependency::DependencyGraph;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Logical path of cached row sets for `table`.
pub fn rows_path(table: &str) -> String {
    format!("rows/{table}")
}

/// Parameter-free key standing for "the rows of `table`" in the dependency
/// graph. Cached results derived from a table depend on this key.
pub fn table_source_key(tenant: &str, table: &str) -> CacheKey {
    CacheKey::bare(tenant, rows_path(table))
}

/// Kind of event that triggers invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    TableWrite,
    RowAdd,
    RowUpdate,
    RowDelete,
    TenantReset,
    ScheduledSweep,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::TableWrite,
        OperationKind::RowAdd,
        OperationKind::RowUpdate,
        OperationKind::RowDelete,
        OperationKind::TenantReset,
        OperationKind::ScheduledSweep,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::TableWrite => "table_write",
            OperationKind::RowAdd => "row_add",
            OperationKind::RowUpdate => "row_update",
            OperationKind::RowDelete => "row_delete",
            OperationKind::TenantReset => "tenant_reset",
            OperationKind::ScheduledSweep => "scheduled_sweep",
        };
        f.write_str(name)
    }
}

/// What a rule gets to know about the mutation.
#[derive(Debug, Clone, Default)]
pub struct InvalidationContext {
    pub table: Option<String>,
    /// Additional logical paths to drop
    pub paths: Vec<String>,
}

impl InvalidationContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            paths: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }
}

/// Strategy for one operation kind.
pub trait InvalidationRule: Send + Sync {
    fn name(&self) -> &str;

    /// Evict from `targets`; returns the keys removed.
    fn apply(
        &self,
        tenant: &str,
        context: &InvalidationContext,
        targets: &[Arc<dyn CacheInvalidator>],
    ) -> TabulaResult<Vec<CacheKey>>;
}

/// Drops the well-known row path of the touched table plus any extra paths.
pub struct PathRule;

impl InvalidationRule for PathRule {
    fn name(&self) -> &str {
        "path"
    }

    fn apply(
        &self,
        tenant: &str,
        context: &InvalidationContext,
        targets: &[Arc<dyn CacheInvalidator>],
    ) -> TabulaResult<Vec<CacheKey>> {
        let table = context.table.as_deref().ok_or_else(|| {
            TabulaError::InvalidArguments("path invalidation needs a table".to_string())
        })?;
        let mut paths = vec![rows_path(table)];
        paths.extend(context.paths.iter().cloned());

        let mut removed = Vec::new();
        for target in targets {
            for path in &paths {
                removed.extend(target.invalidate_path(tenant, path));
            }
        }
        Ok(removed)
    }
}

/// Drops everything the tenant has cached.
pub struct TenantWipeRule;

impl InvalidationRule for TenantWipeRule {
    fn name(&self) -> &str {
        "tenant_wipe"
    }

    fn apply(
        &self,
        tenant: &str,
        _context: &InvalidationContext,
        targets: &[Arc<dyn CacheInvalidator>],
    ) -> TabulaResult<Vec<CacheKey>> {
        Ok(targets
            .iter()
            .flat_map(|target| target.invalidate_tenant(tenant))
            .collect())
    }
}

/// Physically removes expired entries of every tenant.
pub struct ExpiredSweepRule;

impl InvalidationRule for ExpiredSweepRule {
    fn name(&self) -> &str {
        "expired_sweep"
    }

    fn apply(
        &self,
        _tenant: &str,
        _context: &InvalidationContext,
        targets: &[Arc<dyn CacheInvalidator>],
    ) -> TabulaResult<Vec<CacheKey>> {
        Ok(targets
            .iter()
            .flat_map(|target| target.sweep_expired())
            .collect())
    }
}

/// Invalidation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub rule_runs: u64,
    pub keys_invalidated: u64,
    pub keys_cascaded: u64,
    pub rule_failures: u64,
}

pub struct InvalidationStrategy {
    targets: Vec<Arc<dyn CacheInvalidator>>,
    rules: RwLock<HashMap<OperationKind, Arc<dyn InvalidationRule>>>,
    graph: DependencyGraph,
    max_depth: usize,
    rule_runs: AtomicU64,
    keys_invalidated: AtomicU64,
    keys_cascaded: AtomicU64,
    rule_failures: AtomicU64,
}

impl InvalidationStrategy {
    /// Strategy over `targets` with the default rule set.
    pub fn new(targets: Vec<Arc<dyn CacheInvalidator>>, max_depth: usize) -> Self {
        let strategy = Self {
            targets,
            rules: RwLock::new(HashMap::new()),
            graph: DependencyGraph::new(),
            max_depth,
            rule_runs: AtomicU64::new(0),
            keys_invalidated: AtomicU64::new(0),
            keys_cascaded: AtomicU64::new(0),
            rule_failures: AtomicU64::new(0),
        };
        for kind in [
            OperationKind::TableWrite,
            OperationKind::RowAdd,
            OperationKind::RowUpdate,
            OperationKind::RowDelete,
        ] {
            strategy.register_rule(kind, Arc::new(PathRule));
        }
        strategy.register_rule(OperationKind::TenantReset, Arc::new(TenantWipeRule));
        strategy.register_rule(OperationKind::ScheduledSweep, Arc::new(ExpiredSweepRule));
        strategy
    }

    /// Replaces the rule for `kind`.
    pub fn register_rule(&self, kind: OperationKind, rule: Arc<dyn InvalidationRule>) {
        self.rules.write().insert(kind, rule);
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// See [`DependencyGraph::add_dependency`].
    pub fn add_dependency(&self, dependent: CacheKey, source: CacheKey) -> bool {
        self.graph.add_dependency(dependent, source)
    }

    /// Runs the rule registered for `kind`. Failures are logged and yield no keys.
    pub fn smart_invalidate(
        &self,
        tenant: &str,
        kind: OperationKind,
        context: &InvalidationContext,
    ) -> Vec<CacheKey> {
        let Some(rule) = self.rules.read().get(&kind).cloned() else {
            debug!(tenant, %kind, "no invalidation rule registered");
            return Vec::new();
        };

        self.rule_runs.fetch_add(1, Ordering::Relaxed);
        match rule.apply(tenant, context, &self.targets) {
            Ok(removed) => {
                self.keys_invalidated
                    .fetch_add(removed.len() as u64, Ordering::Relaxed);
                match kind {
                    OperationKind::TenantReset => self.graph.remove_tenant(tenant),
                    OperationKind::ScheduledSweep => {
                        for key in &removed {
                            self.graph.remove_key(key);
                        }
                    }
                    _ => {}
                }
                debug!(tenant, %kind, rule = rule.name(), removed = removed.len(), "invalidated");
                removed
            }
            Err(e) => {
                self.rule_failures.fetch_add(1, Ordering::Relaxed);
                warn!(tenant, %kind, rule = rule.name(), error = %e, "invalidation rule failed");
                Vec::new()
            }
        }
    }

    /// Removes every dependent of `source` up to `max_depth` edges away and
    /// drops their edges. Hitting the bound is logged, not an error.
    pub fn cascade(&self, source: &CacheKey, max_depth: usize) -> Vec<CacheKey> {
        let walk = self.graph.cascade(source, max_depth);
        if walk.truncated {
            warn!(source = %source, max_depth, "cascade stopped at depth bound");
        }
        for key in &walk.keys {
            for target in &self.targets {
                target.invalidate_key(key);
            }
            self.graph.remove_key(key);
        }
        self.keys_cascaded
            .fetch_add(walk.keys.len() as u64, Ordering::Relaxed);
        walk.keys
    }

    /// Rule for `kind`, then a cascade from `touched_key` and from every key the
    /// rule removed.
    pub fn on_mutation(
        &self,
        tenant: &str,
        kind: OperationKind,
        context: &InvalidationContext,
        touched_key: Option<&CacheKey>,
    ) -> Vec<CacheKey> {
        let removed = self.smart_invalidate(tenant, kind, context);

        let mut sources: BTreeSet<CacheKey> = removed.iter().cloned().collect();
        if let Some(key) = touched_key {
            sources.insert(key.clone());
        }

        let mut all: Vec<CacheKey> = removed;
        for source in &sources {
            all.extend(self.cascade(source, self.max_depth));
        }
        for source in &sources {
            self.graph.remove_key(source);
        }
        all
    }

    /// Table-level mutation: drops the table's cached rows and everything derived from them.
    pub fn table_changed(&self, tenant: &str, kind: OperationKind, table: &str) -> Vec<CacheKey> {
        self.on_mutation(
            tenant,
            kind,
            &InvalidationContext::table(table),
            Some(&table_source_key(tenant, table)),
        )
    }

    /// Scheduled sweep of expired entries across all tenants.
    pub fn sweep(&self) -> Vec<CacheKey> {
        self.smart_invalidate("*", OperationKind::ScheduledSweep, &InvalidationContext::none())
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            rule_runs: self.rule_runs.load(Ordering::Relaxed),
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
            keys_cascaded: self.keys_cascaded.load(Ordering::Relaxed),
            rule_failures: self.rule_failures.load(Ordering::Relaxed),
        }
    }
}
