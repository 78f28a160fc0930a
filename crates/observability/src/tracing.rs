//! Tracing/logging initialization.
//!
//! Structured JSON lines on stdout, filtered via `RUST_LOG`. Consume loops
//! and task workers log with field syntax (`event_id = %id`), so keeping the
//! JSON formatter process-wide makes those fields queryable downstream.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default_filter("info");
}

/// Initialize with an explicit fallback filter (used when `RUST_LOG` is
/// unset). Handy for worker binaries that want `debug` locally.
pub fn init_with_default_filter(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
