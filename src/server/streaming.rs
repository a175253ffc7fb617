//! SSE (Server-Sent Events) streaming of download progress.
//!
//! Each [`DownloadProgress`] becomes one `progress` event whose data is the
//! JSON-encoded snapshot. Terminal snapshots are sent as `complete` or
//! `failed` events so clients can filter on the event name alone.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio_stream::StreamExt;

use crate::download::{DownloadProgress, DownloadStatus};

fn event_name(status: DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::Complete => "complete",
        DownloadStatus::Failed => "failed",
        DownloadStatus::Started | DownloadStatus::InProgress => "progress",
    }
}

/// Convert a progress stream into an SSE stream.
pub fn progress_to_sse_stream<S>(progress: S) -> impl Stream<Item = Result<Event, Infallible>>
where
    S: Stream<Item = DownloadProgress>,
{
    progress.map(|progress| {
        let data = serde_json::to_string(&progress).unwrap_or_default();
        Ok(Event::default()
            .event(event_name(progress.status))
            .id(progress.job_id.clone())
            .data(data))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(event_name(DownloadStatus::Started), "progress");
        assert_eq!(event_name(DownloadStatus::InProgress), "progress");
        assert_eq!(event_name(DownloadStatus::Complete), "complete");
        assert_eq!(event_name(DownloadStatus::Failed), "failed");
    }

    #[tokio::test]
    async fn test_one_event_per_snapshot() {
        let snapshots = vec![
            DownloadProgress::started("book:1", "job-1"),
            DownloadProgress::failed("book:1", "job-1", "boom"),
        ];
        let events: Vec<_> = progress_to_sse_stream(tokio_stream::iter(snapshots))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_ok()));
    }
}
