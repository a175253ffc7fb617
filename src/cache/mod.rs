//! Two-tier cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`key`]: composite `(collection, key)` identity
//! - [`entry`]: memory-tier entries and persisted metadata records
//! - [`memory`]: bounded in-process tier (L1)
//! - [`evictor`]: LRU victim selection that never touches pinned entries
//! - [`coordinator`]: coalescing of concurrent fetches per key
//! - [`lock`]: striped per-key critical sections for writes and deletes
//! - [`metadata`]: persisted freshness / access / pin state
//! - [`priority`]: persisted per-resource retention priority
//! - [`policy`]: cache policies and the result envelope
//! - [`service`]: the orchestrator tying the tiers together
//! - [`maintenance`]: memory trimming and the expiry sweep

pub mod coordinator;
pub mod entry;
pub mod evictor;
pub mod key;
pub mod lock;
pub mod maintenance;
pub mod memory;
pub mod metadata;
pub mod policy;
pub mod priority;
pub mod service;
pub mod size;

pub use key::CacheKey;
pub use policy::{CachePolicy, CacheResult, CacheSource};
pub use service::{CacheService, CacheStats, CacheValue};
