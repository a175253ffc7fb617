//! Striped per-key locks.
//!
//! Serializes the multi-step updates of one key (payload write, metadata
//! write, expiry delete) without a lock per key. Keys hash onto a fixed set
//! of async mutexes, so unrelated keys only contend when they share a stripe.
//! A holder must never take a second stripe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use crate::cache::key::CacheKey;

const STRIPE_COUNT: usize = 64;

pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_index(&self, key: &CacheKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Hold the critical section for `key` until the guard drops.
    pub async fn lock(&self, key: &CacheKey) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)].lock().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new()
    }
}
