//! Error types for the Tabula core.
//!
//! All public APIs return `TabulaResult<T>`; no panics in library code.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Category of a failure surfaced by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorCategory {
    /// Remote quota exhausted (requests per minute, cells, ...)
    Quota,
    /// Credentials lack access to the resource
    Permission,
    /// Resource or table does not exist
    NotFound,
    /// Transient outage or network failure
    Unavailable,
    /// Anything the store could not classify
    Other,
}

impl fmt::Display for StoreErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreErrorCategory::Quota => "quota",
            StoreErrorCategory::Permission => "permission",
            StoreErrorCategory::NotFound => "not-found",
            StoreErrorCategory::Unavailable => "unavailable",
            StoreErrorCategory::Other => "other",
        };
        f.write_str(name)
    }
}

/// Unified error type for all Tabula operations.
#[derive(Debug, Error)]
pub enum TabulaError {
    /// Malformed query text. Never partially executed.
    #[error("query parse error in {clause}: {message}")]
    Parse { clause: String, message: String },

    /// Unknown field, operator or aggregate at execution time
    #[error("query execution error: {message}\nContext: {context}")]
    Execution { message: String, context: String },

    /// Tenant exceeded its request quota; the caller must back off
    #[error("rate limit exceeded for tenant '{tenant}', retry after {retry_after:?}")]
    RateLimited { tenant: String, retry_after: Duration },

    /// A queued pool acquisition exceeded its deadline
    #[error("timed out after {waited:?} waiting for a connection to '{resource}' (tenant '{tenant}')")]
    PoolTimeout {
        tenant: String,
        resource: String,
        waited: Duration,
    },

    /// Failure reported by the backing store
    #[error("backing store error ({category}): {message}")]
    BackingStore {
        category: StoreErrorCategory,
        message: String,
    },

    /// One operation of a batch failed; siblings are unaffected
    #[error("batched {kind} operation failed: {message}")]
    BatchOperation { kind: String, message: String },

    /// Tenant is not registered
    #[error("tenant '{0}' not found")]
    TenantNotFound(String),

    /// Tenant is registered but disabled
    #[error("tenant '{0}' is disabled")]
    TenantDisabled(String),

    /// Invalid configuration value
    #[error("configuration error for '{key}': {message}")]
    Config { key: String, message: String },

    /// Invalid arguments
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The component was shut down while the request was in flight
    #[error("{0} is shut down")]
    Shutdown(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for all Tabula operations.
pub type TabulaResult<T> = Result<T, TabulaError>;

impl TabulaError {
    /// Shorthand for a parse error on a named clause.
    pub fn parse(clause: impl Into<String>, message: impl Into<String>) -> Self {
        TabulaError::Parse {
            clause: clause.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an execution error.
    pub fn execution(message: impl Into<String>, context: impl Into<String>) -> Self {
        TabulaError::Execution {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Shorthand for a backing store error.
    pub fn store(category: StoreErrorCategory, message: impl Into<String>) -> Self {
        TabulaError::BackingStore {
            category,
            message: message.into(),
        }
    }

    /// Whether the caller may retry later. The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            TabulaError::RateLimited { .. } | TabulaError::PoolTimeout { .. } => true,
            TabulaError::BackingStore { category, .. } => matches!(
                category,
                StoreErrorCategory::Quota | StoreErrorCategory::Unavailable
            ),
            _ => false,
        }
    }
}

// Conversions
impl From<serde_json::Error> for TabulaError {
    fn from(err: serde_json::Error) -> Self {
        TabulaError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_parse() {
        let err = TabulaError::parse("WHERE", "nested boolean grouping is not supported");
        assert_eq!(
            err.to_string(),
            "query parse error in WHERE: nested boolean grouping is not supported"
        );
    }

    #[test]
    fn error_display_tenant_not_found() {
        let err = TabulaError::TenantNotFound("acme".to_string());
        assert_eq!(err.to_string(), "tenant 'acme' not found");
    }

    #[test]
    fn error_display_backing_store() {
        let err = TabulaError::store(StoreErrorCategory::Quota, "read requests per minute");
        assert!(err.to_string().contains("(quota)"));
        assert!(err.to_string().contains("read requests per minute"));
    }

    #[test]
    fn error_display_execution() {
        let err = TabulaError::execution("unknown field 'totl'", "WHERE totl > 100");
        assert!(err.to_string().contains("unknown field"));
        assert!(err.to_string().contains("WHERE totl"));
    }

    #[test]
    fn retryable_classification() {
        let rate = TabulaError::RateLimited {
            tenant: "acme".to_string(),
            retry_after: Duration::from_secs(1),
        };
        assert!(rate.is_retryable());
        assert!(TabulaError::store(StoreErrorCategory::Unavailable, "503").is_retryable());
        assert!(!TabulaError::store(StoreErrorCategory::Permission, "403").is_retryable());
        assert!(!TabulaError::parse("SELECT", "empty").is_retryable());
    }

    #[test]
    fn serde_json_error_converts() {
        let err: TabulaError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, TabulaError::Serialization(_)));
    }
}
