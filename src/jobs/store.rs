//! In-memory job status store
//!
//! The only shared mutable state in the service. Every write validates the
//! lifecycle: illegal transitions, writes after a terminal state and
//! progress regressions are rejected or clamped here, not at call sites.

use super::{Job, JobId, JobPayload, JobSnapshot, JobSource, JobStatus};
use crate::error::{Result, SegmentationError};
use crate::services::ProcessingStage;
use crate::types::SegmentationResult;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Highest progress a non-terminal job can report
const MAX_ACTIVE_PROGRESS: u8 = 99;

/// Shared, cloneable handle to the job table
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    sequence: Arc<AtomicU64>,
}

impl JobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| SegmentationError::internal("Job store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| SegmentationError::internal("Job store lock poisoned"))
    }

    fn with_job<T>(&self, id: &JobId, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(id).ok_or_else(|| Self::missing(id))?;
        f(job)
    }

    fn missing(id: &JobId) -> SegmentationError {
        SegmentationError::not_found(format!("Task {id} not found"))
    }

    /// Register a new job in `queued`
    ///
    /// # Errors
    /// `Internal` when the store lock is poisoned
    pub fn create(&self, source: JobSource, payload: JobPayload, threshold: f32) -> Result<JobSnapshot> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            progress: ProcessingStage::Queued.progress_percentage(),
            message: ProcessingStage::Queued.description().to_string(),
            source,
            threshold,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            payload: Some(payload),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let snapshot = job.snapshot();
        self.write()?.insert(job.id, job);
        Ok(snapshot)
    }

    /// Take the job's payload; succeeds once per job
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Conflict` when the job was already claimed or is terminal
    pub fn claim(&self, id: &JobId) -> Result<JobPayload> {
        self.with_job(id, |job| {
            if job.status.is_terminal() {
                return Err(SegmentationError::conflict(format!(
                    "Task {id} is already {}",
                    job.status
                )));
            }
            job.payload
                .take()
                .ok_or_else(|| SegmentationError::conflict(format!("Task {id} already claimed")))
        })
    }

    /// Move a job to `status` with a new message
    ///
    /// Progress is raised to the stage's entry value, never lowered.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Internal` for an illegal transition
    pub fn transition(&self, id: &JobId, status: JobStatus, message: &str) -> Result<()> {
        if matches!(status, JobStatus::Completed | JobStatus::Error) {
            return Err(SegmentationError::internal(format!(
                "Terminal status {status} must be set through complete() or fail()"
            )));
        }
        self.with_job(id, |job| {
            Self::check_transition(job, status)?;
            let entry = match status {
                JobStatus::Downloading => ProcessingStage::Downloading.progress_percentage(),
                _ => job.progress,
            };
            job.status = status;
            job.progress = job.progress.max(entry);
            job.message = message.to_string();
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Record progress for an active job
    ///
    /// Values below the current progress are ignored and values are capped
    /// below 100, which only completion may set.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Internal` when the job is terminal
    pub fn update_progress(&self, id: &JobId, progress: u8, message: &str) -> Result<()> {
        self.with_job(id, |job| {
            if job.status.is_terminal() {
                return Err(SegmentationError::internal(format!(
                    "Progress update for {} task {id}",
                    job.status
                )));
            }
            let clamped = progress.min(MAX_ACTIVE_PROGRESS);
            if clamped >= job.progress {
                job.progress = clamped;
                job.message = message.to_string();
                job.updated_at = Utc::now();
            }
            Ok(())
        })
    }

    /// Mark a processing job completed with its result
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Internal` when the job is not processing
    pub fn complete(&self, id: &JobId, result: SegmentationResult) -> Result<()> {
        self.with_job(id, |job| {
            Self::check_transition(job, JobStatus::Completed)?;
            job.result = Some(result);
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.message = ProcessingStage::Completed.description().to_string();
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Mark an active job failed
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Internal` when the job is already terminal
    pub fn fail(&self, id: &JobId, message: &str) -> Result<()> {
        self.with_job(id, |job| {
            Self::check_transition(job, JobStatus::Error)?;
            job.status = JobStatus::Error;
            job.message = message.to_string();
            job.error = Some(message.to_string());
            job.payload = None;
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Current state of a job
    ///
    /// # Errors
    /// `NotFound` for an unknown id
    pub fn snapshot(&self, id: &JobId) -> Result<JobSnapshot> {
        self.read()?
            .get(id)
            .map(Job::snapshot)
            .ok_or_else(|| Self::missing(id))
    }

    /// Jobs newest first, optionally filtered by status
    ///
    /// # Errors
    /// `Internal` when the store lock is poisoned
    pub fn list(&self, limit: usize, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>> {
        let jobs = self.read()?;
        let mut matching: Vec<&Job> = jobs
            .values()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .collect();
        matching.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(matching.into_iter().take(limit).map(Job::snapshot).collect())
    }

    /// Delete a terminal job's record
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Conflict` when the job is still active
    pub fn remove(&self, id: &JobId) -> Result<JobSnapshot> {
        let mut jobs = self.write()?;
        let job = jobs.get(id).ok_or_else(|| Self::missing(id))?;
        if !job.status.is_terminal() {
            return Err(SegmentationError::conflict(format!(
                "Task {id} is {} and cannot be deleted until it finishes",
                job.status
            )));
        }
        jobs.remove(id)
            .map(|job| job.snapshot())
            .ok_or_else(|| Self::missing(id))
    }

    /// Number of jobs in each status
    ///
    /// # Errors
    /// `Internal` when the store lock is poisoned
    pub fn counts(&self) -> Result<HashMap<JobStatus, usize>> {
        let mut counts = HashMap::new();
        for job in self.read()?.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// # Errors
    /// `Internal` when the store lock is poisoned
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// # Errors
    /// `Internal` when the store lock is poisoned
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    fn check_transition(job: &Job, next: JobStatus) -> Result<()> {
        if job.can_transition_to(next) {
            Ok(())
        } else {
            Err(SegmentationError::internal(format!(
                "Illegal transition for task {}: {} -> {}",
                job.id, job.status, next
            )))
        }
    }
}
