//! Pluggable serialization for cached keys and values.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use stash_core::error::{StashError, StashResult};

/// Turns one kind of cached object into bytes and back
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> StashResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> StashResult<T>;
}

/// serde_json codec for any serde type
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> StashResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| StashError::serialization(format!("Failed to encode object: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> StashResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| StashError::serialization(format!("Failed to decode object: {}", e)))
    }
}

/// Pass-through codec for values that already are bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> StashResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> StashResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}
