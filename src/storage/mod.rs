//! Durable key/value tier (L2).
//!
//! The cache engine only depends on the [`PersistentTier`] contract. Two
//! backends ship with the crate:
//! - [`memory`]: a process-local map, for tests and ephemeral sessions
//! - [`file`]: one directory per collection on local disk, optionally zstd-compressed

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored key is not valid: {0}")]
    InvalidKey(String),

    #[error("Stored entry is corrupt: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Namespaced durable key/value storage.
///
/// `ttl` is advisory: backends keep payloads until they are deleted. Expiry is
/// decided by the cache metadata, so stale payloads stay readable for the
/// stale-on-error fallback.
#[async_trait]
pub trait PersistentTier: Send + Sync {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        collection: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &str, collection: &str) -> Result<Option<Bytes>, StoreError>;

    async fn delete(&self, key: &str, collection: &str) -> Result<(), StoreError>;

    async fn exists(&self, key: &str, collection: &str) -> Result<bool, StoreError>;

    async fn get_all_keys(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    async fn clear_collection(&self, collection: &str) -> Result<(), StoreError>;

    /// Bytes used by a collection.
    async fn size_of(&self, collection: &str) -> Result<u64, StoreError>;
}
