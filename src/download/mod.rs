//! Bulk "download a whole resource" jobs.
//!
//! - [`queue`]: bounded worker pool, retries and priority marking
//! - [`progress`]: progress events broadcast to subscribers

pub mod progress;
pub mod queue;

pub use progress::{DownloadProgress, DownloadStatus};
pub use queue::{DownloadHandle, DownloadQueue, ResourceFetcher};
