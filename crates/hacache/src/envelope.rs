//! The stored envelope wrapping every cached payload.
//!
//! Whatever codec the user injects for the payload itself, the bytes that
//! reach storage are always the bincode encoding of [`CachedValue`]: the
//! payload plus the creation timestamp the engine classifies freshness
//! against. Keeping the envelope encoding fixed means the age check never
//! depends on the payload format.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Wall-clock unix seconds.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Age class of a stored envelope relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within `expiration`: serve as-is.
    Fresh,
    /// Beyond `expiration` but within the acceptable grace: serve the
    /// stored value and refresh asynchronously.
    Stale,
    /// Beyond the grace as well: must be refreshed synchronously.
    Invalid,
}

/// A cached payload plus its creation timestamp.
///
/// Written on every successful store, never mutated in place; a newer
/// envelope replaces an older one atomically at the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Payload in the injected codec's format. Opaque to the engine.
    pub bytes: Vec<u8>,
    /// Unix seconds at which this envelope was constructed.
    pub create_ts: i64,
}

impl CachedValue {
    /// Wraps `bytes`, stamping the current wall-clock second.
    pub fn new(bytes: Vec<u8>) -> Self {
        CachedValue {
            bytes,
            create_ts: unix_timestamp(),
        }
    }

    /// Wraps `bytes` with an explicit timestamp.
    pub fn with_create_ts(bytes: Vec<u8>, create_ts: i64) -> Self {
        CachedValue { bytes, create_ts }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Classifies this envelope's age at `now` (unix seconds).
    ///
    /// The envelope is [`Fresh`](Freshness::Fresh) up to and including
    /// `create_ts + expiration`, [`Stale`](Freshness::Stale) for a further
    /// `max_acceptable` seconds, and [`Invalid`](Freshness::Invalid) after
    /// that.
    pub fn classify(&self, now: i64, expiration: Duration, max_acceptable: Duration) -> Freshness {
        let expire_at = self.create_ts + expiration.as_secs() as i64;
        if now <= expire_at {
            return Freshness::Fresh;
        }

        if now <= expire_at + max_acceptable.as_secs() as i64 {
            return Freshness::Stale;
        }

        Freshness::Invalid
    }
}
