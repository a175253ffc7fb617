//! Progress events emitted by bulk downloads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Started,
    InProgress,
    Complete,
    Failed,
}

/// Snapshot of one download job, broadcast after every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub resource_id: String,

    /// Unique per job, so repeated downloads of one resource can be told apart.
    pub job_id: String,

    pub completed_items: usize,

    /// Root metadata and child index count as one item each.
    pub total_items: usize,

    /// Children skipped after exhausting their retries.
    pub failed_items: usize,

    pub status: DownloadStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DownloadProgress {
    pub fn started(resource_id: &str, job_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            job_id: job_id.to_string(),
            completed_items: 0,
            total_items: 2,
            failed_items: 0,
            status: DownloadStatus::Started,
            error_message: None,
        }
    }

    pub fn failed(resource_id: &str, job_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::Failed,
            error_message: Some(message.into()),
            ..Self::started(resource_id, job_id)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, DownloadStatus::Complete | DownloadStatus::Failed)
    }

    /// Completed share of the job (0.0 - 1.0).
    pub fn fraction(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.completed_items as f64 / self.total_items as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction_and_terminal() {
        let mut p = DownloadProgress::started("book:1", "job");
        assert_eq!(p.fraction(), 0.0);
        assert!(!p.is_terminal());

        p.completed_items = 1;
        assert_eq!(p.fraction(), 0.5);

        let failed = DownloadProgress::failed("book:1", "job", "boom");
        assert!(failed.is_terminal());
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&DownloadStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
