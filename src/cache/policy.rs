//! Freshness policies and the result type returned by every read.

use serde::{Deserialize, Serialize};

use crate::cache::entry::CacheMetadata;
use crate::cache::key::CacheKey;
use crate::error::CacheError;

/// How a `fetch` balances cached data against the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Never touch the network.
    CacheOnly,
    /// Always fetch; cached data is neither read nor used as fallback. The
    /// memory tier is skipped too, so even a resident value is refetched.
    NetworkOnly,
    /// Serve any cached value immediately; refresh stale values in the
    /// background when online.
    CacheFirst,
    /// Serve fresh cached values; otherwise fetch, falling back to stale data
    /// on failure.
    NetworkFirst,
    /// Serve any cached value immediately and always refresh stale values in
    /// the background.
    StaleWhileRevalidate,
}

impl CachePolicy {
    /// Whether this policy reads the cache tiers at all.
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CachePolicy::NetworkOnly)
    }
}

/// Where a `CacheResult` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Memory,
    Persistent,
    Network,
    /// Stale persistent data served because the network path failed.
    StaleFallback,
    NotFound,
    Error,
}

/// Outcome of a cache read. Expected misses and stale reads are values here,
/// not errors.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub data: Option<T>,
    pub source: CacheSource,
    pub is_hit: bool,
    /// The data is older than the requested TTL.
    pub is_stale: bool,
    pub metadata: Option<CacheMetadata>,
    pub error: Option<CacheError>,
}

impl<T> CacheResult<T> {
    pub fn memory(data: T, metadata: Option<CacheMetadata>) -> Self {
        Self {
            data: Some(data),
            source: CacheSource::Memory,
            is_hit: true,
            is_stale: false,
            metadata,
            error: None,
        }
    }

    pub fn persistent(data: T, metadata: Option<CacheMetadata>, is_stale: bool) -> Self {
        Self {
            data: Some(data),
            source: CacheSource::Persistent,
            is_hit: true,
            is_stale,
            metadata,
            error: None,
        }
    }

    pub fn network(data: T, metadata: Option<CacheMetadata>) -> Self {
        Self {
            data: Some(data),
            source: CacheSource::Network,
            is_hit: false,
            is_stale: false,
            metadata,
            error: None,
        }
    }

    /// Stale data served after `error` on the network path.
    pub fn stale_fallback(data: T, metadata: Option<CacheMetadata>, error: CacheError) -> Self {
        Self {
            data: Some(data),
            source: CacheSource::StaleFallback,
            is_hit: true,
            is_stale: true,
            metadata,
            error: Some(error),
        }
    }

    pub fn not_found(key: &CacheKey) -> Self {
        Self {
            data: None,
            source: CacheSource::NotFound,
            is_hit: false,
            is_stale: false,
            metadata: None,
            error: Some(CacheError::NotFound(key.clone())),
        }
    }

    pub fn error(error: CacheError) -> Self {
        Self {
            data: None,
            source: CacheSource::Error,
            is_hit: false,
            is_stale: false,
            metadata: None,
            error: Some(error),
        }
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Convert into a `Result`, keeping stale fallbacks as `Ok`.
    pub fn into_result(self) -> Result<T, CacheError> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(err)) => Err(err),
            (None, None) => Err(CacheError::Store("empty cache result".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_flags() {
        assert!(!CachePolicy::NetworkOnly.reads_cache());
        assert!(CachePolicy::CacheOnly.reads_cache());
        assert!(CachePolicy::StaleWhileRevalidate.reads_cache());
    }

    #[test]
    fn test_stale_fallback_is_ok_with_error_attached() {
        let result = CacheResult::stale_fallback(7, None, CacheError::Offline);
        assert!(result.is_hit);
        assert_eq!(result.error, Some(CacheError::Offline));
        assert_eq!(result.into_result(), Ok(7));
    }

    #[test]
    fn test_not_found_into_result() {
        let key = CacheKey::new("c", "k");
        let result: CacheResult<u8> = CacheResult::not_found(&key);
        assert_eq!(result.into_result(), Err(CacheError::NotFound(key)));
    }
}
