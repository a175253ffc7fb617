//! Bounded-concurrency download queue.
//!
//! A job caches a resource's root metadata, then its child index, then every
//! child. Children are retried with linear backoff and skipped once their
//! retries run out, so one bad child never fails the job. A finished job
//! marks the resource `High` priority.
//!
//! At most one job per resource id is active. The active entry is removed by
//! a drop guard owned by the job task, whatever the outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::key::CacheKey;
use crate::cache::priority::PriorityLevel;
use crate::cache::service::{CacheService, CacheValue};
use crate::config::DownloadConfig;
use crate::download::progress::{DownloadProgress, DownloadStatus};
use crate::error::{CacheError, Result};

/// Source of the pieces of a downloadable resource.
#[async_trait]
pub trait ResourceFetcher: Send + Sync + 'static {
    type Meta: CacheValue;
    type Child: CacheValue;

    async fn fetch_meta(&self, resource_id: &str) -> anyhow::Result<Self::Meta>;

    /// Ids of the resource's children, in download order.
    async fn fetch_child_list(&self, resource_id: &str) -> anyhow::Result<Vec<String>>;

    async fn fetch_child_content(
        &self,
        resource_id: &str,
        child_id: &str,
    ) -> anyhow::Result<Self::Child>;
}

type Completion = Shared<BoxFuture<'static, DownloadProgress>>;
type ActiveMap = Arc<Mutex<HashMap<String, Completion>>>;

/// Handle to a queued or running download.
pub struct DownloadHandle {
    pub resource_id: String,
    pub job_id: String,
    completion: Completion,
}

impl DownloadHandle {
    /// Wait for the job to finish and return its final progress.
    pub async fn wait(self) -> DownloadProgress {
        self.completion.await
    }
}

pub struct DownloadQueue {
    service: Arc<CacheService>,
    config: DownloadConfig,
    permits: Arc<Semaphore>,
    active: ActiveMap,
    progress: Mutex<Option<broadcast::Sender<DownloadProgress>>>,
    closed: AtomicBool,
}

impl DownloadQueue {
    pub fn new(service: Arc<CacheService>, config: DownloadConfig) -> Self {
        let (tx, _) = broadcast::channel(config.progress_buffer.max(1));
        Self {
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            service,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
            progress: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a download of `resource_id`.
    ///
    /// Fails with `DownloadInProgress` while a job for the same id is active
    /// and with `QueueClosed` after [`shutdown`](Self::shutdown).
    pub fn download_resource<F: ResourceFetcher>(
        &self,
        resource_id: &str,
        fetcher: Arc<F>,
    ) -> Result<DownloadHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::QueueClosed);
        }
        let progress = self.progress.lock().clone().ok_or(CacheError::QueueClosed)?;

        let mut active = self.active.lock();
        if active.contains_key(resource_id) {
            debug!(resource_id, "Download already active");
            return Err(CacheError::DownloadInProgress(resource_id.to_string()));
        }

        let job_id = Uuid::new_v4().to_string();
        let job = DownloadJob {
            resource_id: resource_id.to_string(),
            job_id: job_id.clone(),
            service: self.service.clone(),
            config: self.config.clone(),
            permits: self.permits.clone(),
            progress,
            fetcher,
        };
        let guard = ActiveGuard {
            active: self.active.clone(),
            resource_id: resource_id.to_string(),
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            job.run().await
        });

        let (id, job) = (resource_id.to_string(), job_id.clone());
        let completion = async move {
            match task.await {
                Ok(progress) => progress,
                Err(e) => DownloadProgress::failed(&id, &job, format!("download task aborted: {e}")),
            }
        }
        .boxed()
        .shared();

        active.insert(resource_id.to_string(), completion.clone());
        info!(resource_id, job_id = %job_id, "Download queued");

        Ok(DownloadHandle {
            resource_id: resource_id.to_string(),
            job_id,
            completion,
        })
    }

    /// An independent stream of progress events. Lagging subscribers skip
    /// the events they missed. The stream ends after shutdown.
    pub fn subscribe(&self) -> impl Stream<Item = DownloadProgress> + Send + 'static {
        let rx = match self.progress.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        BroadcastStream::new(rx).filter_map(|event| match event {
            Ok(progress) => Some(progress),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress subscriber lagged");
                None
            }
        })
    }

    pub fn is_active(&self, resource_id: &str) -> bool {
        self.active.lock().contains_key(resource_id)
    }

    pub fn active_downloads(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    /// Whether a full download of the resource has completed before.
    pub fn is_downloaded(&self, resource_id: &str) -> bool {
        self.service.priorities().is_retained(resource_id)
    }

    /// Reject new jobs, wait for active ones, then close progress streams.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let pending: Vec<Completion> = self.active.lock().values().cloned().collect();
        info!(active = pending.len(), "Draining download queue");
        for completion in pending {
            completion.await;
        }
        self.progress.lock().take();
        info!("Download queue stopped");
    }
}

struct ActiveGuard {
    active: ActiveMap,
    resource_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.resource_id);
    }
}

struct DownloadJob<F> {
    resource_id: String,
    job_id: String,
    service: Arc<CacheService>,
    config: DownloadConfig,
    permits: Arc<Semaphore>,
    progress: broadcast::Sender<DownloadProgress>,
    fetcher: Arc<F>,
}

impl<F: ResourceFetcher> DownloadJob<F> {
    async fn run(self) -> DownloadProgress {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return DownloadProgress::failed(&self.resource_id, &self.job_id, "queue closed");
        };

        self.service.priorities().touch(&self.resource_id).await;
        let mut progress = DownloadProgress::started(&self.resource_id, &self.job_id);
        self.emit(&progress);

        match self.download(&mut progress).await {
            Ok(()) => {
                self.service
                    .priorities()
                    .set_priority(&self.resource_id, PriorityLevel::High)
                    .await;
                progress.status = DownloadStatus::Complete;
                info!(
                    resource_id = %self.resource_id,
                    completed = progress.completed_items,
                    failed = progress.failed_items,
                    "Download complete"
                );
            }
            Err(e) => {
                progress.status = DownloadStatus::Failed;
                progress.error_message = Some(format!("{e:#}"));
                warn!(resource_id = %self.resource_id, error = %e, "Download failed");
            }
        }

        self.emit(&progress);
        progress
    }

    async fn download(&self, progress: &mut DownloadProgress) -> anyhow::Result<()> {
        let id = self.resource_id.as_str();
        let ttl = Some(self.config.item_ttl());

        let meta = self
            .fetcher
            .fetch_meta(id)
            .await
            .context("fetching resource metadata")?;
        self.service
            .cache_data(&CacheKey::new(&self.config.meta_collection, id), meta, ttl, false)
            .await?;
        self.tick(progress);

        let children = self
            .fetcher
            .fetch_child_list(id)
            .await
            .context("fetching child list")?;
        progress.total_items = 2 + children.len();
        self.service
            .cache_data(
                &CacheKey::new(&self.config.index_collection, id),
                children.clone(),
                ttl,
                false,
            )
            .await?;
        self.tick(progress);

        for child in &children {
            match self.fetch_child(child).await {
                Ok(content) => {
                    let key = CacheKey::new(&self.config.content_collection, format!("{id}/{child}"));
                    if let Err(e) = self.service.cache_data(&key, content, ttl, false).await {
                        warn!(resource_id = id, child = %child, error = %e, "Failed to cache child");
                        progress.failed_items += 1;
                    }
                }
                Err(e) => {
                    warn!(resource_id = id, child = %child, error = %e, "Skipping child after retries");
                    progress.failed_items += 1;
                }
            }
            self.tick(progress);
        }

        Ok(())
    }

    /// One attempt plus up to `max_retries` retries; attempt `n` waits
    /// `n * retry_backoff` first.
    async fn fetch_child(&self, child: &str) -> anyhow::Result<F::Child> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch_child_content(&self.resource_id, child).await {
                Ok(content) => return Ok(content),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(child, attempt, error = %e, "Retrying child");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn tick(&self, progress: &mut DownloadProgress) {
        progress.completed_items += 1;
        progress.status = DownloadStatus::InProgress;
        self.emit(progress);
    }

    fn emit(&self, progress: &DownloadProgress) {
        // No subscribers is fine.
        let _ = self.progress.send(progress.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::config::Config;
    use crate::storage::MemoryStore;

    struct Book {
        chapters: Vec<String>,
        /// How many times each chapter fails before succeeding.
        failures: HashMap<String, usize>,
        attempts: Mutex<HashMap<String, usize>>,
        fail_meta: bool,
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl Book {
        fn new(chapters: &[&str]) -> Self {
            Self {
                chapters: chapters.iter().map(|c| c.to_string()).collect(),
                failures: HashMap::new(),
                attempts: Mutex::new(HashMap::new()),
                fail_meta: false,
                delay: Duration::ZERO,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        fn attempts(&self, chapter: &str) -> usize {
            self.attempts.lock().get(chapter).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ResourceFetcher for Book {
        type Meta = String;
        type Child = String;

        async fn fetch_meta(&self, resource_id: &str) -> anyhow::Result<String> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail_meta {
                anyhow::bail!("404 Not Found");
            }
            Ok(format!("meta for {resource_id}"))
        }

        async fn fetch_child_list(&self, _resource_id: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.chapters.clone())
        }

        async fn fetch_child_content(&self, _resource_id: &str, child_id: &str) -> anyhow::Result<String> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let n = attempts.entry(child_id.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            let failures = self.failures.get(child_id).copied().unwrap_or(0);
            if attempt <= failures {
                anyhow::bail!("attempt {attempt} failed");
            }
            Ok(format!("content of {child_id}"))
        }
    }

    fn queue() -> DownloadQueue {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        config.downloads.retry_backoff_ms = 1;
        let service = CacheService::builder(&config, Arc::new(MemoryStore::new())).build();
        DownloadQueue::new(service, config.downloads)
    }

    #[tokio::test]
    async fn test_retry_then_succeed_and_skip_exhausted() {
        let queue = queue();
        let mut book = Book::new(&["ch1", "ch2", "ch3"]);
        book.failures.insert("ch2".to_string(), 2);
        book.failures.insert("ch3".to_string(), 10);
        let book = Arc::new(book);

        let result = queue
            .download_resource("book:7", book.clone())
            .unwrap()
            .wait()
            .await;

        assert_eq!(result.status, DownloadStatus::Complete);
        assert_eq!(result.total_items, 5);
        assert_eq!(result.completed_items, 5);
        assert_eq!(result.failed_items, 1);
        assert_eq!(book.attempts("ch2"), 3);
        assert_eq!(book.attempts("ch3"), 3);

        let service = &queue.service;
        let cached: Option<String> = service
            .get_cached_data(&CacheKey::new("resource_content", "book:7/ch2"), None)
            .await
            .into_data();
        assert_eq!(cached.as_deref(), Some("content of ch2"));
        assert!(!service
            .contains(&CacheKey::new("resource_content", "book:7/ch3"))
            .await);
        assert!(queue.is_downloaded("book:7"));
    }

    #[tokio::test]
    async fn test_meta_failure_reports_failed() {
        let queue = queue();
        let mut book = Book::new(&["ch1"]);
        book.fail_meta = true;

        let result = queue
            .download_resource("book:8", Arc::new(book))
            .unwrap()
            .wait()
            .await;
        assert_eq!(result.status, DownloadStatus::Failed);
        assert!(result.error_message.unwrap().contains("404"));
        assert!(!queue.is_downloaded("book:8"));
        assert!(!queue.is_active("book:8"));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_while_active() {
        let queue = queue();
        let mut book = Book::new(&[]);
        book.delay = Duration::from_millis(50);
        let book = Arc::new(book);

        let first = queue.download_resource("book:1", book.clone()).unwrap();
        let err = queue.download_resource("book:1", book.clone()).err();
        assert_eq!(err, Some(CacheError::DownloadInProgress("book:1".to_string())));

        first.wait().await;
        tokio::task::yield_now().await;
        assert!(!queue.is_active("book:1"));
        assert!(queue.download_resource("book:1", book).is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let queue = queue();
        let mut book = Book::new(&[]);
        book.delay = Duration::from_millis(30);
        let book = Arc::new(book);

        let handles: Vec<_> = (0..6)
            .map(|i| queue.download_resource(&format!("book:{i}"), book.clone()).unwrap())
            .collect();
        for handle in handles {
            assert_eq!(handle.wait().await.status, DownloadStatus::Complete);
        }
        assert!(book.max_running.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_progress_stream_and_shutdown() {
        let queue = queue();
        let events = queue.subscribe();

        queue
            .download_resource("book:2", Arc::new(Book::new(&["ch1"])))
            .unwrap();
        queue.shutdown().await;

        let events: Vec<DownloadProgress> = events.collect().await;
        let statuses: Vec<DownloadStatus> = events.iter().map(|p| p.status).collect();
        assert_eq!(statuses.first(), Some(&DownloadStatus::Started));
        assert_eq!(statuses.last(), Some(&DownloadStatus::Complete));
        assert_eq!(events.len(), 5);

        let err = queue
            .download_resource("book:3", Arc::new(Book::new(&[])))
            .err();
        assert_eq!(err, Some(CacheError::QueueClosed));
    }
}
