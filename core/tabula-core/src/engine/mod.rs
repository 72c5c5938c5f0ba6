//! Engine Module
//!
//! Services built on top of the pool, batcher and caches.

pub mod data_access;
pub mod plan;
pub mod platform;
pub mod segment;
pub mod tenant;

pub use data_access::{DataAccess, ReadOptions, RowCache};
pub use plan::{PlanCache, PlanCacheStats};
pub use platform::{Platform, PlatformStats};
pub use segment::{ExecuteOptions, QueryEngine, QueryResult, Segment, SegmentCache, segment_path};
pub use tenant::{StaticTenantRegistry, TenantInfo, TenantResolver};
