//! Segmentation jobs: lifecycle, status store and orchestration
//!
//! A job moves `queued → downloading (URL jobs only) → processing →
//! completed`, and may fail into `error` from any non-terminal state.
//! Terminal jobs never change again.

pub mod orchestrator;
pub mod store;

pub use orchestrator::{HealthStatus, JobOrchestrator, JobProgressReporter};
pub use store::JobStore;

use crate::error::{Result, SegmentationError};
use crate::types::SegmentationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job identifier
pub type JobId = Uuid;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SegmentationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "downloading" => Ok(JobStatus::Downloading),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "error" => Ok(JobStatus::Error),
            other => Err(SegmentationError::validation(format!(
                "Unknown status '{other}'. Expected one of: queued, downloading, processing, completed, error"
            ))),
        }
    }
}

/// Where the job's image comes from, as shown to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobSource {
    Upload { filename: String },
    Url { url: String },
}

impl JobSource {
    #[must_use]
    pub fn is_url(&self) -> bool {
        matches!(self, JobSource::Url { .. })
    }
}

/// Input handed to the worker that claims the job
#[derive(Clone, PartialEq, Eq)]
pub enum JobPayload {
    Upload { bytes: Vec<u8>, extension: String },
    Url { url: String },
}

impl fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPayload::Upload { bytes, extension } => f
                .debug_struct("Upload")
                .field("bytes", &bytes.len())
                .field("extension", extension)
                .finish(),
            JobPayload::Url { url } => f.debug_struct("Url").field("url", url).finish(),
        }
    }
}

/// A job record as held by the store
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub source: JobSource,
    pub threshold: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<SegmentationResult>,
    pub error: Option<String>,
    /// Taken by the worker that claims the job
    pub payload: Option<JobPayload>,
    /// Submission order, used for newest-first listing
    pub sequence: u64,
}

impl Job {
    /// Whether `next` is a legal successor of the current status
    ///
    /// Upload jobs skip `downloading`; URL jobs must pass through it.
    #[must_use]
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::{Completed, Downloading, Error, Processing, Queued};
        match (self.status, next) {
            (Queued, Downloading) => self.source.is_url(),
            (Queued, Processing) => !self.source.is_url(),
            (Downloading, Processing) | (Processing, Completed) => true,
            (current, Error) => !current.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            source: self.source.clone(),
            threshold: self.threshold,
            created_at: self.created_at,
            updated_at: self.updated_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Point-in-time copy of a job, safe to hand to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub task_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub source: JobSource,
    pub threshold: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SegmentationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(source: JobSource, status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            status,
            progress: 0,
            message: String::new(),
            source,
            threshold: 0.5,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            payload: None,
            sequence: 0,
        }
    }

    #[test]
    fn test_upload_transitions() {
        let upload = JobSource::Upload {
            filename: "a.png".to_string(),
        };
        let queued = job(upload.clone(), JobStatus::Queued);
        assert!(queued.can_transition_to(JobStatus::Processing));
        assert!(!queued.can_transition_to(JobStatus::Downloading));
        assert!(!queued.can_transition_to(JobStatus::Completed));
        assert!(queued.can_transition_to(JobStatus::Error));

        let done = job(upload, JobStatus::Completed);
        for next in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Error,
        ] {
            assert!(!done.can_transition_to(next));
        }
    }

    #[test]
    fn test_url_transitions() {
        let url = JobSource::Url {
            url: "http://example.com/a.jpg".to_string(),
        };
        let queued = job(url.clone(), JobStatus::Queued);
        assert!(queued.can_transition_to(JobStatus::Downloading));
        assert!(!queued.can_transition_to(JobStatus::Processing));

        let downloading = job(url, JobStatus::Downloading);
        assert!(downloading.can_transition_to(JobStatus::Processing));
        assert!(downloading.can_transition_to(JobStatus::Error));
        assert!(!downloading.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("Completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
        assert!("finished".parse::<JobStatus>().is_err());
        assert_eq!(serde_json::to_string(&JobStatus::Downloading).unwrap(), "\"downloading\"");
    }

    #[test]
    fn test_snapshot_omits_empty_result() {
        let snapshot = job(
            JobSource::Url {
                url: "http://example.com/a.jpg".to_string(),
            },
            JobStatus::Queued,
        )
        .snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["source"]["type"], "url");
        assert_eq!(json["status"], "queued");
    }
}
