//! # Tabula: multi-tenant core over a tabular backing store
//!
//! Tabula makes a remote, quota-limited spreadsheet-like store behave like a
//! small queryable database shared by many tenants.
//!
//! ## Features
//!
//! - **Query engine**: `SELECT ... FROM ... WHERE ... GROUP BY ... ORDER BY ... LIMIT`
//!   over tenant tables, with a parse cache
//! - **Tenant cache**: TTL cache keyed by (tenant, path, params) with
//!   rule-based and dependency-cascading invalidation
//! - **Connection pool**: bounded handles, per-tenant sliding-window rate
//!   limiting, FIFO waiters with deadlines
//! - **Batch coordinator**: coalesces reads and appends into few physical calls
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tabula_core::{ExecuteOptions, MemoryStore, Platform, Row, StaticTenantRegistry, TabulaConfig, TenantInfo};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tabula_core::TabulaResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let tenants = StaticTenantRegistry::new().with_tenant("acme", TenantInfo::new("wb-acme"));
//! let platform = Platform::new(TabulaConfig::default(), store, Arc::new(tenants))?;
//!
//! platform
//!     .data()
//!     .add_row("acme", "orders", Row::new().with("campaign", "spring").with("total", 120))
//!     .await?;
//!
//! let result = platform
//!     .query(
//!         "acme",
//!         "SELECT campaign, COUNT(*) AS n FROM orders GROUP BY campaign",
//!         ExecuteOptions::default(),
//!     )
//!     .await?;
//! assert_eq!(result.rows.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Query pipeline
//!
//! ```text
//! text → normalize → PlanCache (hit: Arc<Query>) → sqlparser → Query
//!      → DataAccess::get_rows → TableScan → Filter → Aggregate|Projection → Sort → Limit
//! ```
//!
//! ## Modules
//!
//! - [`sql`]: parser, planner and executor
//! - [`engine`]: data access facade, query engine, tenants, platform wiring
//! - [`storage`]: backing store contract, rows, caches and invalidation
//! - [`pool`]: connection pool and rate limiter
//! - [`batch`]: batch coordinator
//! - [`config`]: configuration

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod sql;
pub mod storage;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use config::TabulaConfig;
pub use engine::{
    DataAccess, ExecuteOptions, Platform, QueryEngine, QueryResult, ReadOptions, Segment,
    StaticTenantRegistry, TenantInfo, TenantResolver,
};
pub use error::{TabulaError, TabulaResult};
pub use storage::{BackingStore, MemoryStore, Row, ScalarValue};
