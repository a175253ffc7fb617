//! File-backed implementation of [`PersistentTier`].
//!
//! Layout: `<root>/<hex(collection)>/<hex(key)>.entry`. Hex-encoding keeps
//! arbitrary keys filesystem-safe and lets `get_all_keys` recover them
//! exactly. Each file starts with a one-byte format tag so stores written with
//! compression enabled stay readable after it is switched off (and vice versa).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::{PersistentTier, StoreError};
use crate::config::StorageConfig;

const ENTRY_EXTENSION: &str = "entry";
const FORMAT_RAW: u8 = 0;
const FORMAT_ZSTD: u8 = 1;

/// I/O counters for a [`FileStore`].
#[derive(Debug, Default)]
struct FileStoreCounters {
    writes: AtomicU64,
    reads: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

/// Snapshot of [`FileStore`] I/O statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStoreStats {
    pub total_writes: u64,
    pub total_reads: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

/// Durable store on the local filesystem.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    compress: bool,
    zstd_level: i32,
    counters: FileStoreCounters,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `config.path`.
    pub async fn open(config: &StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.path).await?;

        Ok(Self {
            root: config.path.clone(),
            compress: config.zstd_compression,
            zstd_level: config.zstd_level,
            counters: FileStoreCounters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(hex::encode(collection))
    }

    fn entry_path(&self, key: &str, collection: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.{ENTRY_EXTENSION}", hex::encode(key)))
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::with_capacity(data.len() + 1);
        if self.compress {
            out.push(FORMAT_ZSTD);
            out.extend(zstd::encode_all(data, self.zstd_level)?);
        } else {
            out.push(FORMAT_RAW);
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    fn decode(path: &Path, raw: &[u8]) -> Result<Bytes, StoreError> {
        match raw.split_first() {
            Some((&FORMAT_RAW, body)) => Ok(Bytes::copy_from_slice(body)),
            Some((&FORMAT_ZSTD, body)) => Ok(Bytes::from(zstd::decode_all(body)?)),
            Some((tag, _)) => Err(StoreError::Corrupt(format!(
                "{}: unknown format tag {tag}",
                path.display()
            ))),
            None => Err(StoreError::Corrupt(format!("{}: empty file", path.display()))),
        }
    }

    /// Get I/O statistics.
    pub fn stats(&self) -> FileStoreStats {
        FileStoreStats {
            total_writes: self.counters.writes.load(Ordering::Relaxed),
            total_reads: self.counters.reads.load(Ordering::Relaxed),
            total_bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            total_bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PersistentTier for FileStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        collection: &str,
        _ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let path = self.entry_path(key, collection);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = self.encode(&data)?;

        // Write-then-rename so readers never observe a half-written entry.
        // Concurrent writers of one key each get their own temp file.
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, &encoded).await?;
        fs::rename(&tmp, &path).await?;

        debug!(
            collection,
            key,
            path = %path.display(),
            size = encoded.len(),
            "Wrote entry to disk"
        );

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    async fn get(&self, key: &str, collection: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.entry_path(key, collection);

        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(raw.len() as u64, Ordering::Relaxed);

        Self::decode(&path, &raw).map(Some)
    }

    async fn delete(&self, key: &str, collection: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key, collection);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(collection, key, path = %path.display(), "Deleted entry file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str, collection: &str) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.entry_path(key, collection)).await?)
    }

    async fn get_all_keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = hex::decode(stem)
                .map_err(|e| StoreError::InvalidKey(format!("{stem}: {e}")))?;
            let key = String::from_utf8(raw)
                .map_err(|e| StoreError::InvalidKey(format!("{stem}: {e}")))?;
            keys.push(key);
        }

        Ok(keys)
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), StoreError> {
        let dir = self.collection_dir(collection);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn size_of(&self, collection: &str) -> Result<u64, StoreError> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0u64;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }

        Ok(total)
    }
}
