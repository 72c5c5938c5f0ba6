//! In-memory backing store
//!
//! Stands in for the remote store when embedding the core in tests,
//! benches and local tooling. Counts every physical call so callers can
//! assert on batching and caching behaviour.

use crate::error::{StoreErrorCategory, TabulaError, TabulaResult};
use crate::storage::{BackingStore, Row, ScalarValue};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Handle returned by [`MemoryStore::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHandle {
    pub id: u64,
    pub tenant: String,
    pub resource_id: String,
}

/// Physical call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connects: usize,
    pub reads: usize,
    pub appends: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.connects + self.reads + self.appends + self.updates + self.deletes
    }
}

/// In-memory backing store keyed by (resource, table).
pub struct MemoryStore {
    tables: RwLock<HashMap<(String, String), Vec<BTreeMap<String, ScalarValue>>>>,
    next_handle: AtomicU64,
    connects: AtomicUsize,
    reads: AtomicUsize,
    appends: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    /// Row counts of every `append_rows` call, in call order
    append_log: Mutex<Vec<(String, usize)>>,
    /// Positions of every `delete_row` call, in call order
    delete_log: Mutex<Vec<usize>>,
    /// Tables whose calls fail with the given category
    failing_tables: RwLock<HashMap<String, StoreErrorCategory>>,
    /// Resources whose `connect` fails
    failing_resources: RwLock<HashSet<String>>,
    latency: RwLock<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            append_log: Mutex::new(Vec::new()),
            delete_log: Mutex::new(Vec::new()),
            failing_tables: RwLock::new(HashMap::new()),
            failing_resources: RwLock::new(HashSet::new()),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// Every physical call sleeps this long first.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = latency;
        self
    }

    /// Seed a table without counting it as a physical call.
    pub fn seed(&self, resource_id: &str, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.write();
        let data = tables
            .entry((resource_id.to_string(), table.to_string()))
            .or_default();
        data.extend(rows.into_iter().map(|row| row.fields));
    }

    /// Snapshot of a table without counting it as a physical call.
    pub fn snapshot(&self, resource_id: &str, table: &str) -> Vec<Row> {
        let tables = self.tables.read();
        tables
            .get(&(resource_id.to_string(), table.to_string()))
            .map(|data| materialize(data, None))
            .unwrap_or_default()
    }

    /// Make every call against `table` fail with `category`.
    pub fn fail_table(&self, table: &str, category: StoreErrorCategory) {
        self.failing_tables.write().insert(table.to_string(), category);
    }

    pub fn heal_table(&self, table: &str) {
        self.failing_tables.write().remove(table);
    }

    /// Make `connect` fail for `resource_id`.
    pub fn fail_connect(&self, resource_id: &str) {
        self.failing_resources.write().insert(resource_id.to_string());
    }

    pub fn calls(&self) -> CallCounts {
        CallCounts {
            connects: self.connects.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            appends: self.appends.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// (table, row count) of every append call so far.
    pub fn append_log(&self) -> Vec<(String, usize)> {
        self.append_log.lock().clone()
    }

    /// Positions of every delete call so far.
    pub fn delete_log(&self) -> Vec<usize> {
        self.delete_log.lock().clone()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_table(&self, table: &str) -> TabulaResult<()> {
        match self.failing_tables.read().get(table) {
            Some(category) => Err(TabulaError::store(
                *category,
                format!("table '{table}' rejected the request"),
            )),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn materialize(data: &[BTreeMap<String, ScalarValue>], limit: Option<usize>) -> Vec<Row> {
    let take = limit.unwrap_or(data.len());
    data.iter()
        .take(take)
        .enumerate()
        .map(|(idx, fields)| Row {
            position: Some(idx + 1),
            fields: fields.clone(),
        })
        .collect()
}

fn locate(len: usize, table: &str, position: usize) -> TabulaResult<usize> {
    if position == 0 || position > len {
        return Err(TabulaError::store(
            StoreErrorCategory::NotFound,
            format!("row {position} does not exist in '{table}' ({len} rows)"),
        ));
    }
    Ok(position - 1)
}

#[async_trait]
impl BackingStore for MemoryStore {
    type Handle = MemoryHandle;

    async fn connect(&self, tenant: &str, resource_id: &str) -> TabulaResult<MemoryHandle> {
        self.simulate_latency().await;
        self.connects.fetch_add(1, Ordering::Relaxed);
        if self.failing_resources.read().contains(resource_id) {
            return Err(TabulaError::store(
                StoreErrorCategory::Unavailable,
                format!("resource '{resource_id}' is unreachable"),
            ));
        }
        Ok(MemoryHandle {
            id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            tenant: tenant.to_string(),
            resource_id: resource_id.to_string(),
        })
    }

    async fn read_rows(
        &self,
        handle: &MemoryHandle,
        table: &str,
        limit: Option<usize>,
    ) -> TabulaResult<Vec<Row>> {
        self.simulate_latency().await;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.check_table(table)?;
        let tables = self.tables.read();
        tables
            .get(&(handle.resource_id.clone(), table.to_string()))
            .map(|data| materialize(data, limit))
            .ok_or_else(|| {
                TabulaError::store(
                    StoreErrorCategory::NotFound,
                    format!("table '{table}' does not exist"),
                )
            })
    }

    async fn append_rows(
        &self,
        handle: &MemoryHandle,
        table: &str,
        rows: Vec<Row>,
    ) -> TabulaResult<Vec<Row>> {
        self.simulate_latency().await;
        self.appends.fetch_add(1, Ordering::Relaxed);
        self.append_log.lock().push((table.to_string(), rows.len()));
        self.check_table(table)?;

        let mut tables = self.tables.write();
        let data = tables
            .entry((handle.resource_id.clone(), table.to_string()))
            .or_default();
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            data.push(row.fields.clone());
            stored.push(Row {
                position: Some(data.len()),
                fields: row.fields,
            });
        }
        Ok(stored)
    }

    async fn update_row(&self, handle: &MemoryHandle, table: &str, row: &Row) -> TabulaResult<Row> {
        self.simulate_latency().await;
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.check_table(table)?;

        let position = row.position.ok_or_else(|| {
            TabulaError::InvalidArguments("update requires a row position".to_string())
        })?;
        let mut tables = self.tables.write();
        let data = tables
            .get_mut(&(handle.resource_id.clone(), table.to_string()))
            .ok_or_else(|| {
                TabulaError::store(
                    StoreErrorCategory::NotFound,
                    format!("table '{table}' does not exist"),
                )
            })?;
        let idx = locate(data.len(), table, position)?;
        data[idx] = row.fields.clone();
        Ok(row.clone())
    }

    async fn delete_row(&self, handle: &MemoryHandle, table: &str, position: usize) -> TabulaResult<()> {
        self.simulate_latency().await;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.delete_log.lock().push(position);
        self.check_table(table)?;

        let mut tables = self.tables.write();
        let data = tables
            .get_mut(&(handle.resource_id.clone(), table.to_string()))
            .ok_or_else(|| {
                TabulaError::store(
                    StoreErrorCategory::NotFound,
                    format!("table '{table}' does not exist"),
                )
            })?;
        let idx = locate(data.len(), table, position)?;
        data.remove(idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: i64, total: i64) -> Row {
        Row::new().with("id", id).with("total", total)
    }

    #[tokio::test]
    async fn test_append_assigns_positions() {
        let store = MemoryStore::new();
        let handle = store.connect("acme", "book-1").await.unwrap();

        let stored = store
            .append_rows(&handle, "orders", vec![order(1, 10), order(2, 20)])
            .await
            .unwrap();
        assert_eq!(stored[0].position, Some(1));
        assert_eq!(stored[1].position, Some(2));
        assert_eq!(store.append_log(), vec![("orders".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_read_with_limit() {
        let store = MemoryStore::new();
        store.seed("book-1", "orders", (1..=5).map(|i| order(i, i * 10)));
        let handle = store.connect("acme", "book-1").await.unwrap();

        let rows = store.read_rows(&handle, "orders", Some(3)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].position, Some(3));
        assert_eq!(store.calls().reads, 1);
    }

    #[tokio::test]
    async fn test_delete_shifts_rows() {
        let store = MemoryStore::new();
        store.seed("book-1", "orders", (1..=3).map(|i| order(i, i)));
        let handle = store.connect("acme", "book-1").await.unwrap();

        store.delete_row(&handle, "orders", 1).await.unwrap();
        let rows = store.snapshot("book-1", "orders");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), &ScalarValue::Int64(2));
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let store = MemoryStore::new();
        store.seed("book-1", "orders", vec![order(1, 1)]);
        let handle = store.connect("acme", "book-1").await.unwrap();

        let err = store.delete_row(&handle, "orders", 9).await.unwrap_err();
        assert!(matches!(
            err,
            TabulaError::BackingStore {
                category: StoreErrorCategory::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failing_table() {
        let store = MemoryStore::new();
        store.seed("book-1", "orders", vec![order(1, 1)]);
        store.fail_table("orders", StoreErrorCategory::Quota);
        let handle = store.connect("acme", "book-1").await.unwrap();

        let err = store.read_rows(&handle, "orders", None).await.unwrap_err();
        assert!(err.is_retryable());

        store.heal_table("orders");
        assert!(store.read_rows(&handle, "orders", None).await.is_ok());
    }
}
