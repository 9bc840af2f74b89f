use std::time::Duration;

use serde::Deserialize;

/// Tuning knobs of a cache engine.
///
/// All fields have defaults, so a config file only needs to spell out what
/// it changes. Durations parse in humantime notation (`"3h"`, `"10m"`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Age at which a stored entry becomes expired.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// Additional grace beyond [`expiration`](Self::expiration) during
    /// which an expired entry is still served while a background refresh
    /// is scheduled. Beyond it the entry is invalid and is refreshed
    /// synchronously.
    #[serde(with = "humantime_serde")]
    pub max_acceptable_expiration: Duration,

    /// Concurrency ceiling for the wrapped computation. Zero or negative
    /// disables the gate.
    pub fn_run_limit: i32,

    /// Capacity of the refresh event queue. Zero or negative disables the
    /// queue entirely: every scheduled refresh is then a counted drop.
    pub event_buffer_size: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            expiration: Duration::from_secs(3 * 3600),
            max_acceptable_expiration: Duration::from_secs(10 * 60),
            fn_run_limit: 50,
            event_buffer_size: 100,
        }
    }
}
