//! Composite cache keys.
//!
//! Every cached item is addressed by a `(collection, key)` pair. The pair is
//! carried as one value through every layer and is never rebuilt from, or
//! split out of, a flat string.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one cached item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Logical namespace (e.g. `"books"`).
    pub collection: String,

    /// Item key inside the collection (e.g. `"book:42"`).
    pub key: String,
}

impl CacheKey {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Flat identifier used where a backend needs a single string.
    ///
    /// The collection is length-prefixed so distinct pairs never collide
    /// (`("a:b", "c")` and `("a", "b:c")` map to different ids). The id is
    /// write-only: records stored under it carry their own `CacheKey`.
    pub fn storage_id(&self) -> String {
        format!("{}:{}:{}", self.collection.len(), self.collection, self.key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}
