//! The storage port: an opaque byte-keyed byte-value store.
//!
//! A miss must be distinguishable from a backend fault — the engine counts
//! and handles the two differently even though both end up recomputing.
//! The crate ships [`MemoryStorage`] for tests and single-process use; the
//! `hacache-redis` crate binds a remote store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The key is not present in the store.
    #[error("cache miss")]
    Miss,
    /// Any other backend fault (connectivity, protocol, …).
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Byte-keyed byte-value store.
///
/// Implementations must be safe for concurrent use; the engine and its
/// worker call into the same instance from different tasks.
pub trait Storage: Send + Sync {
    /// Reads the bytes stored under `key`; [`StorageError::Miss`] when
    /// the key is absent.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, StorageError>>;

    /// Stores `value` under `key`. `None` means no storage-level expiry;
    /// the engine never relies on storage TTL for freshness decisions.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StorageError>>;
}

#[derive(Debug)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-process storage over a locked hash map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>, StorageError>> {
        Box::pin(async move {
            let entries = self.entries.read();
            let entry = entries.get(key).ok_or(StorageError::Miss)?;

            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    return Err(StorageError::Miss);
                }
            }

            Ok(entry.value.clone())
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let entry = MemoryEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            };
            self.entries.write().insert(key.to_owned(), entry);
            Ok(())
        })
    }
}
