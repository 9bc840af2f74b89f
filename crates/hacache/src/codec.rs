//! The payload codec port.
//!
//! The engine never looks inside a payload; it hands bytes to storage and
//! bytes to the codec. Two codecs are provided: [`BincodeCodec`] as the
//! compact schemaless default and [`JsonCodec`] when the stored bytes
//! should stay human-readable. Anything else (a schema'd wire format, a
//! decoder that stamps bookkeeping fields on the way out) is an `impl
//! Codec` away.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Serializes and deserializes the user's result value.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// A typed empty instance, distinct per call.
    ///
    /// Kept on the trait so callers and tests can obtain a decode-shaped
    /// value without going through storage.
    fn fresh_zero(&self) -> T;
}

/// Schemaless binary codec; the default choice.
pub struct BincodeCodec<T> {
    _value: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        BincodeCodec {
            _value: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn fresh_zero(&self) -> T {
        T::default()
    }
}

/// Self-describing JSON codec, for payloads that should be inspectable
/// in place in the backing store.
pub struct JsonCodec<T> {
    _value: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec {
            _value: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn fresh_zero(&self) -> T {
        T::default()
    }
}
