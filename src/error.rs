//! Error taxonomy for the cache engine.
//!
//! `CacheError` is `Clone` so a single failed network fetch can be handed to
//! every requester that was coalesced onto it.

use std::time::Duration;

use thiserror::Error;

use crate::cache::key::CacheKey;
use crate::storage::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("No cached data for {0} and the policy forbids a network fetch")]
    NotFound(CacheKey),

    #[error("Network fetch failed: {0}")]
    Network(String),

    #[error("Network fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("No network connectivity")]
    Offline,

    #[error("Cached value for {key} is not of the requested type: {reason}")]
    TypeMismatch { key: CacheKey, reason: String },

    #[error("Persistent store error: {0}")]
    Store(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Download already in progress for resource {0}")]
    DownloadInProgress(String),

    #[error("Download queue has been shut down")]
    QueueClosed,
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
