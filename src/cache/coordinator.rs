//! Request coalescing: at most one in-flight operation per key.
//!
//! Concurrent callers for the same [`CacheKey`] share one
//! `futures::future::Shared` handle and all observe the same outcome,
//! success or error. The entry is removed by the operation itself when it
//! finishes, so it is cleaned up even if the caller that started it is
//! dropped while others are still waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::key::CacheKey;

type InFlight<V> = Shared<BoxFuture<'static, V>>;

/// Deduplicates concurrent operations by key.
pub struct FetchCoordinator<V>
where
    V: Clone,
{
    in_flight: Arc<Mutex<HashMap<CacheKey, InFlight<V>>>>,
}

impl<V> Default for FetchCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> FetchCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, or join the run already in flight.
    ///
    /// `work` is only invoked when no run is in flight, so for N concurrent
    /// callers it executes exactly once.
    pub async fn run_deduped<F, Fut>(&self, key: &CacheKey, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight fetch");
                    existing.clone()
                }
                None => {
                    let registry = Arc::clone(&self.in_flight);
                    let owned_key = key.clone();
                    let operation = work();
                    let shared = async move {
                        let output = operation.await;
                        registry.lock().remove(&owned_key);
                        output
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    /// Number of keys with an operation in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let coordinator = Arc::new(FetchCoordinator::<Result<u32, String>>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("c", "k");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .run_deduped(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_cleared() {
        let coordinator = FetchCoordinator::<Result<u32, String>>::new();
        let key = CacheKey::new("c", "k");

        let (a, b) = tokio::join!(
            coordinator.run_deduped(&key, || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err("boom".to_string())
            }),
            coordinator.run_deduped(&key, || async { Ok(1) }),
        );
        assert_eq!(a, Err("boom".to_string()));
        assert_eq!(b, Err("boom".to_string()));

        // A later call starts fresh.
        let c = coordinator.run_deduped(&key, || async { Ok(7) }).await;
        assert_eq!(c, Ok(7));
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let coordinator = FetchCoordinator::<u32>::new();
        let key_a = CacheKey::new("c", "a");
        let key_b = CacheKey::new("c", "b");
        let (a, b) = tokio::join!(
            coordinator.run_deduped(&key_a, || async { 1 }),
            coordinator.run_deduped(&key_b, || async { 2 }),
        );
        assert_eq!((a, b), (1, 2));
    }
}
