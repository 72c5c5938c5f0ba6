//! Operation batching for the backing store.
//!
//! Operations for the same (tenant, resource) accumulate in one open batch
//! and are flushed together. A batch flushes when it reaches
//! `max_batch_size`, after `debounce` without new operations, or once it has
//! been open for `max_wait`, whichever comes first.
//!
//! ## Flush order
//!
//! 1. reads, one physical read per distinct table (largest requested limit,
//!    truncated per caller); tables are read concurrently
//! 2. appends in enqueue order; consecutive appends to the same table become
//!    a single `append_rows` call
//! 3. updates, one call each
//! 4. deletes, highest position first so earlier deletes do not shift later ones
//!
//! Every operation gets its own reply. A failed physical call fails only the
//! operations it carried.
//!
//! Flushes for the same (tenant, resource) run one at a time in the order
//! their batches closed, so a later batch never overtakes an earlier one.
//!
//! ## Usage
//!
//! ```ignore
//! let batcher = BatchCoordinator::new(pool, BatchConfig::default());
//! let output = batcher
//!     .enqueue("acme", "book-1", Operation::append("orders", vec![row]))
//!     .await?;
//! ```

use crate::config::BatchConfig;
use crate::error::{TabulaError, TabulaResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::storage::{BackingStore, Row};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One logical operation against a table.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Read { table: String, limit: Option<usize> },
    Append { table: String, rows: Vec<Row> },
    Update { table: String, row: Row },
    Delete { table: String, position: usize },
}

impl Operation {
    pub fn read(table: impl Into<String>, limit: Option<usize>) -> Self {
        Operation::Read {
            table: table.into(),
            limit,
        }
    }

    pub fn append(table: impl Into<String>, rows: Vec<Row>) -> Self {
        Operation::Append {
            table: table.into(),
            rows,
        }
    }

    pub fn update(table: impl Into<String>, row: Row) -> Self {
        Operation::Update {
            table: table.into(),
            row,
        }
    }

    pub fn delete(table: impl Into<String>, position: usize) -> Self {
        Operation::Delete {
            table: table.into(),
            position,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Read { .. } => OpKind::Read,
            Operation::Append { .. } => OpKind::Append,
            Operation::Update { .. } => OpKind::Update,
            Operation::Delete { .. } => OpKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Operation::Read { table, .. }
            | Operation::Append { table, .. }
            | Operation::Update { table, .. }
            | Operation::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Append,
    Update,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpKind::Read => "read",
            OpKind::Append => "append",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        })
    }
}

/// Result delivered to the caller of [`BatchCoordinator::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutput {
    /// Rows read, or rows stored by an append (with positions)
    Rows(Vec<Row>),
    /// Row written by an update
    Row(Row),
    Deleted,
}

impl OpOutput {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            OpOutput::Rows(rows) => rows,
            OpOutput::Row(row) => vec![row],
            OpOutput::Deleted => Vec::new(),
        }
    }
}

/// Counters over the coordinator's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub operations: u64,
    pub physical_calls: u64,
    pub pending: usize,
}

type Reply = oneshot::Sender<TabulaResult<OpOutput>>;

struct PendingOp {
    op: Operation,
    reply: Reply,
}

struct PendingBatch {
    ops: Vec<PendingOp>,
    opened_at: Instant,
    last_enqueue_at: Instant,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    tenant: String,
    resource_id: String,
}

/// A closed batch, chained behind the previous flush for its key.
struct FlushJob {
    ops: Vec<PendingOp>,
    seq: u64,
    after: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
}

struct State {
    open: HashMap<BatchKey, PendingBatch>,
    next_generation: u64,
    /// Completion signal of the most recently closed batch per key
    tails: HashMap<BatchKey, (u64, oneshot::Receiver<()>)>,
    next_seq: u64,
}

impl State {
    /// Close the open batch for `key` and queue it behind the last flush.
    fn close(&mut self, key: &BatchKey) -> Option<FlushJob> {
        let batch = self.open.remove(key)?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let (done, tail) = oneshot::channel();
        let after = self.tails.insert(key.clone(), (seq, tail)).map(|(_, rx)| rx);
        Some(FlushJob {
            ops: batch.ops,
            seq,
            after,
            done,
        })
    }

    /// Forget the tail once the last queued flush for `key` has finished.
    fn release(&mut self, key: &BatchKey, seq: u64) {
        if self.tails.get(key).is_some_and(|(tail, _)| *tail == seq) {
            self.tails.remove(key);
        }
    }
}

pub struct BatchCoordinator<S: BackingStore> {
    pool: Arc<ConnectionPool<S>>,
    config: BatchConfig,
    state: Mutex<State>,
    batches_flushed: AtomicU64,
    operations: AtomicU64,
    physical_calls: AtomicU64,
}

impl<S: BackingStore> BatchCoordinator<S> {
    pub fn new(pool: Arc<ConnectionPool<S>>, config: BatchConfig) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            state: Mutex::new(State {
                open: HashMap::new(),
                next_generation: 1,
                tails: HashMap::new(),
                next_seq: 1,
            }),
            batches_flushed: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            physical_calls: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<S>> {
        &self.pool
    }

    /// Queue `op` and wait for its individual outcome.
    pub async fn enqueue(
        self: &Arc<Self>,
        tenant: &str,
        resource_id: &str,
        op: Operation,
    ) -> TabulaResult<OpOutput> {
        let (reply, outcome) = oneshot::channel();
        let key = BatchKey {
            tenant: tenant.to_string(),
            resource_id: resource_id.to_string(),
        };

        let full = {
            let now = Instant::now();
            let mut state = self.state.lock();
            let State {
                open,
                next_generation,
                ..
            } = &mut *state;
            let batch = open.entry(key.clone()).or_insert_with(|| {
                let generation = *next_generation;
                *next_generation += 1;
                self.spawn_timer(key.clone(), generation);
                PendingBatch {
                    ops: Vec::new(),
                    opened_at: now,
                    last_enqueue_at: now,
                    generation,
                }
            });
            batch.ops.push(PendingOp { op, reply });
            batch.last_enqueue_at = now;

            if batch.ops.len() >= self.config.max_batch_size {
                state.close(&key)
            } else {
                None
            }
        };

        if let Some(job) = full {
            debug!(tenant, resource_id, ops = job.ops.len(), "batch full, flushing");
            // Spawned so that dropping this caller cannot cancel sibling operations.
            tokio::spawn(self.clone().flush(key, job));
        }

        outcome
            .await
            .unwrap_or_else(|_| Err(TabulaError::Shutdown("batch coordinator".to_string())))
    }

    /// Flush every open batch and wait for the flushes to finish.
    pub async fn flush_all(self: &Arc<Self>) {
        let jobs: Vec<(BatchKey, FlushJob)> = {
            let mut state = self.state.lock();
            let keys: Vec<BatchKey> = state.open.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| state.close(&key).map(|job| (key, job)))
                .collect()
        };
        let mut flushes = JoinSet::new();
        for (key, job) in jobs {
            flushes.spawn(self.clone().flush(key, job));
        }
        while flushes.join_next().await.is_some() {}
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            physical_calls: self.physical_calls.load(Ordering::Relaxed),
            pending: self.state.lock().open.values().map(|b| b.ops.len()).sum(),
        }
    }

    /// One timer per batch generation. Re-arms until the quiet period or the
    /// maximum wait has elapsed, then flushes on its own task.
    fn spawn_timer(self: &Arc<Self>, key: BatchKey, generation: u64) {
        let coordinator = self.clone();
        let debounce = self.config.debounce();
        let max_wait = self.config.max_wait();
        tokio::spawn(async move {
            loop {
                let due = {
                    let mut state = coordinator.state.lock();
                    let deadline = match state.open.get(&key) {
                        Some(batch) if batch.generation == generation => {
                            (batch.last_enqueue_at + debounce).min(batch.opened_at + max_wait)
                        }
                        // Flushed by size or flush_all already.
                        _ => return,
                    };
                    if Instant::now() >= deadline {
                        Ok(state.close(&key))
                    } else {
                        Err(deadline)
                    }
                };
                match due {
                    Ok(job) => {
                        if let Some(job) = job {
                            coordinator.flush(key, job).await;
                        }
                        return;
                    }
                    Err(deadline) => tokio::time::sleep_until(deadline).await,
                }
            }
        });
    }

    /// Wait for the previous flush of the same key, run this one, then let
    /// the next one go.
    async fn flush(self: Arc<Self>, key: BatchKey, job: FlushJob) {
        let FlushJob {
            ops,
            seq,
            after,
            done,
        } = job;
        if let Some(previous) = after {
            // An error only means the previous flush task went away.
            let _ = previous.await;
        }
        self.clone().run_batch(key.clone(), ops).await;
        self.state.lock().release(&key, seq);
        drop(done);
    }

    async fn run_batch(self: Arc<Self>, key: BatchKey, ops: Vec<PendingOp>) {
        if ops.is_empty() {
            return;
        }
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.operations
            .fetch_add(ops.len() as u64, Ordering::Relaxed);
        debug!(
            tenant = %key.tenant,
            resource_id = %key.resource_id,
            ops = ops.len(),
            "flushing batch"
        );

        let mut reads: Vec<ReadGroup> = Vec::new();
        let mut appends: Vec<(String, Vec<Row>, Reply)> = Vec::new();
        let mut updates: Vec<(String, Row, Reply)> = Vec::new();
        let mut deletes: Vec<(String, usize, Reply)> = Vec::new();

        for PendingOp { op, reply } in ops {
            match op {
                Operation::Read { table, limit } => {
                    match reads.iter_mut().find(|g| g.table == table) {
                        Some(group) => group.waiters.push((limit, reply)),
                        None => reads.push(ReadGroup {
                            table,
                            waiters: vec![(limit, reply)],
                        }),
                    }
                }
                Operation::Append { table, rows } => appends.push((table, rows, reply)),
                Operation::Update { table, row } => updates.push((table, row, reply)),
                Operation::Delete { table, position } => deletes.push((table, position, reply)),
            }
        }

        if !reads.is_empty() {
            let mut tasks = JoinSet::new();
            for group in reads {
                tasks.spawn(self.clone().run_reads(key.clone(), group));
            }
            while tasks.join_next().await.is_some() {}
        }

        if appends.is_empty() && updates.is_empty() && deletes.is_empty() {
            return;
        }

        let conn = match self.pool.acquire(&key.tenant, &key.resource_id).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(tenant = %key.tenant, error = %e, "batch could not acquire a connection");
                let message = e.to_string();
                for (_, _, reply) in appends {
                    let _ = reply.send(Err(batch_error(OpKind::Append, &message)));
                }
                for (_, _, reply) in updates {
                    let _ = reply.send(Err(batch_error(OpKind::Update, &message)));
                }
                for (_, _, reply) in deletes {
                    let _ = reply.send(Err(batch_error(OpKind::Delete, &message)));
                }
                return;
            }
        };

        self.run_appends(&conn, appends).await;

        for (table, row, reply) in updates {
            self.physical_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = self
                .pool
                .store()
                .update_row(conn.handle(), &table, &row)
                .await
                .map(OpOutput::Row)
                .map_err(|e| batch_error(OpKind::Update, &e.to_string()));
            let _ = reply.send(outcome);
        }

        deletes.sort_by(|a, b| b.1.cmp(&a.1));
        for (table, position, reply) in deletes {
            self.physical_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = self
                .pool
                .store()
                .delete_row(conn.handle(), &table, position)
                .await
                .map(|()| OpOutput::Deleted)
                .map_err(|e| batch_error(OpKind::Delete, &e.to_string()));
            let _ = reply.send(outcome);
        }
    }

    async fn run_reads(self: Arc<Self>, key: BatchKey, group: ReadGroup) {
        let ReadGroup { table, waiters } = group;
        // `None` means "everything", which covers any bounded request.
        let limit = waiters
            .iter()
            .try_fold(0usize, |max, (limit, _)| limit.map(|l| max.max(l)));

        let rows = match self.pool.acquire(&key.tenant, &key.resource_id).await {
            Ok(conn) => {
                self.physical_calls.fetch_add(1, Ordering::Relaxed);
                self.pool
                    .store()
                    .read_rows(conn.handle(), &table, limit)
                    .await
            }
            Err(e) => Err(e),
        };

        match rows {
            Ok(rows) => {
                debug!(table = %table, callers = waiters.len(), rows = rows.len(), "coalesced read");
                for (limit, reply) in waiters {
                    let take = limit.unwrap_or(rows.len()).min(rows.len());
                    let _ = reply.send(Ok(OpOutput::Rows(rows[..take].to_vec())));
                }
            }
            Err(e) => {
                let message = e.to_string();
                for (_, reply) in waiters {
                    let _ = reply.send(Err(batch_error(OpKind::Read, &message)));
                }
            }
        }
    }

    async fn run_appends(&self, conn: &PooledConnection<S>, appends: Vec<(String, Vec<Row>, Reply)>) {
        let mut appends = appends.into_iter().peekable();
        while let Some((table, rows, reply)) = appends.next() {
            let mut counts = vec![rows.len()];
            let mut replies = vec![reply];
            let mut merged = rows;
            while let Some((_, more, reply)) = appends.next_if(|(next, _, _)| *next == table) {
                counts.push(more.len());
                replies.push(reply);
                merged.extend(more);
            }

            self.physical_calls.fetch_add(1, Ordering::Relaxed);
            let sent = merged.len();
            let outcome = self
                .pool
                .store()
                .append_rows(conn.handle(), &table, merged)
                .await;
            match outcome {
                Ok(stored) if stored.len() == sent => {
                    let mut stored = stored.into_iter();
                    for (count, reply) in counts.into_iter().zip(replies) {
                        let rows: Vec<Row> = stored.by_ref().take(count).collect();
                        let _ = reply.send(Ok(OpOutput::Rows(rows)));
                    }
                }
                Ok(stored) => {
                    let message = format!(
                        "store acknowledged {} of {sent} appended rows in '{table}'",
                        stored.len()
                    );
                    for reply in replies {
                        let _ = reply.send(Err(batch_error(OpKind::Append, &message)));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    for reply in replies {
                        let _ = reply.send(Err(batch_error(OpKind::Append, &message)));
                    }
                }
            }
        }
    }
}

struct ReadGroup {
    table: String,
    waiters: Vec<(Option<usize>, Reply)>,
}

fn batch_error(kind: OpKind, message: &str) -> TabulaError {
    TabulaError::BatchOperation {
        kind: kind.to_string(),
        message: message.to_string(),
    }
}
