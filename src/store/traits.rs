//! Storage adapter trait.
//!
//! Session state, processed-message markers, and batch metrics are all stored
//! as opaque bytes under string keys. Backends live outside this crate; the
//! in-process `MemoryStore` is used for tests and single-node runs.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StorageError;

/// Key prefix for VectorClock-guarded session state.
pub const SESSION_PREFIX: &str = "session:";
/// Key prefix for processed-message markers (deduplication).
pub const PROCESSED_PREFIX: &str = "processed:";
/// Key prefix for messages parked for batch processing.
pub const MESSAGE_PREFIX: &str = "message:";
/// Key for aggregate batch metrics.
pub const BATCH_METRICS_KEY: &str = "metrics:batch";

/// Backend-agnostic key/value storage.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the bytes stored under `key`, if any (expired entries are absent).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), StorageError>;
}

/// Read and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes, ttl).await
}
