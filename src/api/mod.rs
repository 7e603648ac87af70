//! Status API: the polling contract between clients and the job orchestrator
//!
//! [`StatusApi`] exposes submission, polling, listing and deletion as typed
//! operations. The HTTP surface in [`server`] is a thin adapter over it.

#[cfg(feature = "server")]
pub mod server;

use crate::{
    error::{Result, SegmentationError},
    jobs::{JobOrchestrator, JobSnapshot, JobSource, JobStatus},
    models::ModelInfo,
    types::SegmentationResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Default page size for task listings
pub const DEFAULT_LIST_LIMIT: usize = 10;

/// Largest page size for task listings
pub const MAX_LIST_LIMIT: usize = 100;

/// Model details for the service info endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub backbone: String,
    pub patch_size: u32,
    pub num_classes: u8,
    pub vegetation_classes: Vec<u8>,
}

/// Service identification and model status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSummary>,
}

/// Health probe body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub model_loaded: bool,
    pub active_jobs: usize,
}

/// URL submission body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlSubmission {
    pub url: String,
    #[serde(default)]
    pub threshold: Option<f32>,
}

/// Acknowledgement of an accepted submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<JobSnapshot> for SubmissionResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            status: snapshot.status,
            message: snapshot.message,
            created_at: snapshot.created_at,
        }
    }
}

/// Full task state returned by polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SegmentationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<JobSnapshot> for TaskResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            status: snapshot.status,
            progress: snapshot.progress,
            message: snapshot.message,
            result: snapshot.result,
            error: snapshot.error,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// One entry of a task listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub source: JobSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vegetation_percentage: Option<f64>,
}

impl From<JobSnapshot> for TaskSummary {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            status: snapshot.status,
            progress: snapshot.progress,
            message: snapshot.message,
            source: snapshot.source,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            vegetation_percentage: snapshot.result.map(|r| r.vegetation_percentage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub message: String,
}

/// Typed facade over the orchestrator
#[derive(Debug, Clone)]
pub struct StatusApi {
    orchestrator: Arc<JobOrchestrator>,
}

impl StatusApi {
    #[must_use]
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self { orchestrator }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Service name, version and model details
    #[must_use]
    pub fn info(&self) -> ServiceInfo {
        let config = self.orchestrator.config();
        let model = self.orchestrator.model_info().map(|info: ModelInfo| {
            let background = config.pipeline.background_class;
            ModelSummary {
                name: info.name,
                backbone: config.model.backbone.clone(),
                patch_size: info.input_size,
                num_classes: info.num_classes,
                vegetation_classes: (0..info.num_classes).filter(|c| *c != background).collect(),
            }
        });
        ServiceInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_loaded: model.is_some(),
            model,
        }
    }

    /// Health probe
    ///
    /// # Errors
    /// `ServiceUnavailable` when no model is loaded or the service is
    /// shutting down
    pub fn health(&self) -> Result<HealthResponse> {
        let health = self.orchestrator.health();
        if !health.model_loaded {
            return Err(SegmentationError::service_unavailable("Model not loaded"));
        }
        if !health.accepting_jobs {
            return Err(SegmentationError::service_unavailable("Service is shutting down"));
        }
        Ok(HealthResponse {
            status: "healthy".to_string(),
            timestamp: health.timestamp,
            model_loaded: health.model_loaded,
            active_jobs: health.active_jobs,
        })
    }

    /// Submit an uploaded file
    ///
    /// # Errors
    /// As [`JobOrchestrator::submit_upload`]
    pub fn submit_upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        threshold: Option<f32>,
    ) -> Result<SubmissionResponse> {
        self.orchestrator
            .submit_upload(filename, bytes, threshold)
            .map(SubmissionResponse::from)
    }

    /// Submit an image URL
    ///
    /// # Errors
    /// As [`JobOrchestrator::submit_url`]
    pub fn submit_url(&self, request: &UrlSubmission) -> Result<SubmissionResponse> {
        self.orchestrator
            .submit_url(&request.url, request.threshold)
            .map(SubmissionResponse::from)
    }

    /// Poll one task
    ///
    /// # Errors
    /// `NotFound` for unknown or malformed ids
    pub fn task(&self, task_id: &str) -> Result<TaskResponse> {
        let id = parse_task_id(task_id)?;
        self.orchestrator.status(&id).map(TaskResponse::from)
    }

    /// Recent tasks, newest first
    ///
    /// # Errors
    /// `Validation` for an unknown status filter
    pub fn tasks(&self, limit: Option<usize>, status: Option<&str>) -> Result<TaskListResponse> {
        let status = status
            .filter(|s| !s.trim().is_empty())
            .map(str::parse::<JobStatus>)
            .transpose()?;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let tasks = self
            .orchestrator
            .list(limit, status)?
            .into_iter()
            .map(TaskSummary::from)
            .collect();
        Ok(TaskListResponse { tasks })
    }

    /// Delete a finished task and its files
    ///
    /// # Errors
    /// - `NotFound` for unknown or malformed ids
    /// - `Conflict` while the task is still active
    pub async fn delete(&self, task_id: &str) -> Result<DeleteResponse> {
        let id = parse_task_id(task_id)?;
        self.orchestrator.delete(&id).await?;
        Ok(DeleteResponse {
            message: format!("Task {id} deleted"),
        })
    }

    /// Artifact bytes by file name
    ///
    /// # Errors
    /// - `Validation` for names that are not a plain file name
    /// - `NotFound` when the artifact does not exist
    pub async fn artifact(&self, filename: &str) -> Result<Vec<u8>> {
        self.orchestrator.artifacts().read_artifact(filename).await
    }
}

fn parse_task_id(task_id: &str) -> Result<Uuid> {
    Uuid::parse_str(task_id.trim())
        .map_err(|_| SegmentationError::not_found(format!("Task {task_id} not found")))
}
