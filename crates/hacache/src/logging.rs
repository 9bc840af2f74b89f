//! Log setup helpers for binaries embedding the cache.
//!
//! The library itself only emits `tracing` events; hosts that already
//! install a subscriber can ignore this module.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Human-readable log output, filtered by an env-filter directive
/// (e.g. `"info"` or `"hacache=debug"`).
pub fn init_pretty(env_filter: &str) {
    fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(true)
        .init();
}

/// JSON-lines log output for machine consumption.
pub fn init_json(env_filter: &str) {
    fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(true)
        .json()
        .flatten_event(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
