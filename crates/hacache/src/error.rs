use thiserror::Error;

use crate::codec::CodecError;
use crate::storage::StorageError;

/// Errors surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The key function returned an empty string.
    #[error("invalid cache key")]
    InvalidKey,

    /// A foreground computation was rejected by the concurrency gate.
    #[error("computation concurrency limit reached")]
    FnRunLimited,

    /// Storage failure on a direct envelope read or write.
    ///
    /// The read-through path never surfaces this: there, storage trouble
    /// degrades into a recompute.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// The wrapped computation itself failed.
    #[error("computation failed: {0}")]
    Computation(anyhow::Error),
}
