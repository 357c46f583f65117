//! Durable key-value storage used for cache entries, sync state, queued
//! writes and the bearer credential.
//!
//! - `MemoryStore`: process-local store, used in tests and for ephemeral runs
//! - `FileStore`: one JSON file per key under the cache directory

mod file;
mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Asynchronous persistent key-value store over JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
