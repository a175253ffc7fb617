//! fetch-cache-tier: two-tier fetch cache with request coalescing.
//!
//! Serves reads from a bounded in-memory tier backed by a durable key/value
//! tier, falling through to a caller-supplied network fetch:
//!   Memory (L1, LRU + pins) → Persistent (L2, JSON payloads) → Network
//!
//! Concurrent fetches of one key share a single network call, stale data is
//! served when the network fails, and bulk downloads run on a bounded queue
//! with progress streaming.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod download;
pub mod error;
pub mod metrics;
pub mod server;
pub mod storage;

pub use cache::{CacheKey, CachePolicy, CacheResult, CacheService, CacheSource};
pub use error::{CacheError, Result};
