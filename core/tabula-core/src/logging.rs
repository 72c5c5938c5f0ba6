//! Tracing setup for hosts that do not install their own subscriber.
//!
//! The core only emits `tracing` events. Pool admissions, batch flushes and
//! cache traffic log at `debug`, so the default filter keeps those targets
//! one notch quieter than the requested level.

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "TABULA_LOG";

/// Noisy per-request targets.
const CHATTY_TARGETS: [&str; 3] = [
    "tabula_core::pool",
    "tabula_core::batch",
    "tabula_core::storage::cache",
];

/// Filter directives for `level`: the crate at `level`, request-path
/// targets capped at `info`.
pub fn default_directives(level: &str) -> String {
    let level = match level.trim().to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => l.to_string(),
        _ => "info".to_string(),
    };
    let mut directives = vec![format!("tabula_core={level}")];
    if matches!(level.as_str(), "trace" | "debug") {
        directives.extend(CHATTY_TARGETS.iter().map(|t| format!("{t}=info")));
    }
    directives.join(",")
}

#[cfg(feature = "logging")]
mod subscriber {
    use super::{LOG_ENV, default_directives};
    use tracing_subscriber::{EnvFilter, fmt};

    fn filter(level: &str) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
    }

    pub fn init_with_level(level: &str) {
        // A host subscriber wins; ours is then silently skipped.
        let _ = fmt()
            .with_env_filter(filter(level))
            .with_target(true)
            .with_line_number(true)
            .try_init();
    }

    pub fn init_test() {
        let _ = fmt()
            .with_env_filter(EnvFilter::new("tabula_core=debug"))
            .with_test_writer()
            .try_init();
    }
}

/// Install a formatter at `info`. `TABULA_LOG`, then `RUST_LOG`, override.
///
/// ```rust
/// tabula_core::logging::init();
/// ```
pub fn init() {
    init_with_level("info")
}

#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    subscriber::init_with_level(level)
}

/// Everything at `debug`, written through the test harness.
#[cfg(feature = "logging")]
pub fn init_test() {
    subscriber::init_test()
}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}
