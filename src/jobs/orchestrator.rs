//! Job orchestration: submission, dispatch and the worker pool
//!
//! Submissions are validated, recorded as `queued` and pushed onto an
//! unbounded channel, so they never wait on processing. A dispatcher hands
//! job ids to at most `workers` concurrent workers, each of which claims its
//! job's payload from the store and runs the pipeline to a terminal state.

use super::{JobId, JobPayload, JobSnapshot, JobSource, JobStatus, JobStore};
use crate::{
    config::ServiceConfig,
    download::{HttpImageFetcher, ImageFetcher},
    error::{Result, SegmentationError},
    inference::ModelHandle,
    models::ModelInfo,
    processor::SegmentationProcessor,
    services::{ArtifactStore, ProcessingStage, ProgressReporter, ProgressTracker, ProgressUpdate},
    types::{ProcessingTimings, SegmentationResult},
    utils::{NumericValidator, PathValidator},
};
use chrono::{DateTime, Utc};
use instant::Instant;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Writes pipeline progress into the job store
pub struct JobProgressReporter {
    store: JobStore,
    job_id: JobId,
}

impl JobProgressReporter {
    #[must_use]
    pub fn new(store: JobStore, job_id: JobId) -> Self {
        Self { store, job_id }
    }
}

impl ProgressReporter for JobProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if let Err(e) = self
            .store
            .update_progress(&self.job_id, update.progress, &update.description)
        {
            warn!(job_id = %self.job_id, "Dropping progress update: {e}");
        }
    }

    fn report_completion(&self, timings: &ProcessingTimings) {
        debug!(job_id = %self.job_id, "Pipeline finished: {}", timings.summary());
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        warn!(job_id = %self.job_id, stage = stage.description(), "Pipeline failed: {error}");
    }
}

/// Readiness summary for health probes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub model_loaded: bool,
    pub accepting_jobs: bool,
    pub active_jobs: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.model_loaded && self.accepting_jobs
    }
}

/// State shared by the dispatcher and every worker
#[derive(Clone)]
struct Worker {
    store: JobStore,
    model: ModelHandle,
    artifacts: ArtifactStore,
    fetcher: Arc<dyn ImageFetcher>,
    config: Arc<ServiceConfig>,
}

/// Entry point for submitting, querying and deleting jobs
pub struct JobOrchestrator {
    worker: Worker,
    sender: Mutex<Option<mpsc::UnboundedSender<JobId>>>,
    accepting: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("workers", &self.worker.config.jobs.workers)
            .field("accepting", &self.accepting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    /// Start an orchestrator that fetches URLs over HTTP
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failures
    pub fn start(config: ServiceConfig, model: ModelHandle) -> Result<Arc<Self>> {
        let fetcher = HttpImageFetcher::new(config.jobs.fetch_timeout(), config.jobs.max_download_bytes)?;
        Self::with_fetcher(config, model, Arc::new(fetcher))
    }

    /// Start an orchestrator with a custom image fetcher
    ///
    /// # Errors
    /// Invalid configuration
    pub fn with_fetcher(
        config: ServiceConfig,
        model: ModelHandle,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let workers = config.jobs.workers;
        let worker = Worker {
            store: JobStore::new(),
            model,
            artifacts: ArtifactStore::new(config.storage.clone()),
            fetcher,
            config: Arc::new(config),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(worker.clone().dispatch(receiver, workers));
        info!(workers, "Job orchestrator started");

        Ok(Arc::new(Self {
            worker,
            sender: Mutex::new(Some(sender)),
            accepting: AtomicBool::new(true),
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    #[must_use]
    pub fn store(&self) -> &JobStore {
        &self.worker.store
    }

    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.worker.artifacts
    }

    #[must_use]
    pub fn model(&self) -> &ModelHandle {
        &self.worker.model
    }

    #[must_use]
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.worker.model.info()
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.worker.config
    }

    /// Submit an uploaded image
    ///
    /// # Errors
    /// - `ServiceUnavailable` when no model is loaded or after shutdown
    /// - `Validation` for an unsupported extension, empty or oversize
    ///   payload, or invalid threshold
    pub fn submit_upload(&self, filename: &str, bytes: Vec<u8>, threshold: Option<f32>) -> Result<JobSnapshot> {
        self.ensure_ready()?;
        let jobs = &self.worker.config.jobs;
        let extension = PathValidator::validate_upload_extension(filename, &jobs.allowed_extensions)?;
        PathValidator::validate_upload_size(bytes.len(), jobs.max_upload_bytes)?;
        let threshold = self.resolve_threshold(threshold)?;

        let snapshot = self.worker.store.create(
            JobSource::Upload {
                filename: filename.to_string(),
            },
            JobPayload::Upload { bytes, extension },
            threshold,
        )?;
        self.enqueue(snapshot)
    }

    /// Submit an image URL
    ///
    /// # Errors
    /// - `ServiceUnavailable` when no model is loaded or after shutdown
    /// - `Validation` for a missing or non-http(s) URL or invalid threshold
    pub fn submit_url(&self, url: &str, threshold: Option<f32>) -> Result<JobSnapshot> {
        self.ensure_ready()?;
        PathValidator::validate_source_url(url)?;
        let threshold = self.resolve_threshold(threshold)?;
        let url = url.trim().to_string();

        let snapshot = self.worker.store.create(
            JobSource::Url { url: url.clone() },
            JobPayload::Url { url },
            threshold,
        )?;
        self.enqueue(snapshot)
    }

    /// Current state of a job
    ///
    /// # Errors
    /// `NotFound` for an unknown id
    pub fn status(&self, id: &JobId) -> Result<JobSnapshot> {
        self.worker.store.snapshot(id)
    }

    /// Jobs newest first
    ///
    /// # Errors
    /// `Internal` when the store is unusable
    pub fn list(&self, limit: usize, status: Option<JobStatus>) -> Result<Vec<JobSnapshot>> {
        self.worker.store.list(limit, status)
    }

    /// Delete a finished job and its files
    ///
    /// # Errors
    /// - `NotFound` for an unknown id
    /// - `Conflict` while the job is still active
    /// - `Io` when files cannot be removed
    pub async fn delete(&self, id: &JobId) -> Result<JobSnapshot> {
        let removed = self.worker.store.remove(id)?;
        let files = self.worker.artifacts.delete_job_files(id).await?;
        info!(job_id = %id, files, "Task deleted");
        Ok(removed)
    }

    /// Readiness of the model and the queue
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        let active_jobs = self
            .worker
            .store
            .counts()
            .map(|counts| {
                counts
                    .iter()
                    .filter(|(status, _)| !status.is_terminal())
                    .map(|(_, n)| n)
                    .sum::<usize>()
            })
            .unwrap_or(0);
        HealthStatus {
            model_loaded: self.worker.model.is_ready(),
            accepting_jobs: self.accepting.load(Ordering::SeqCst),
            active_jobs,
            timestamp: Utc::now(),
        }
    }

    /// Stop accepting jobs and wait for queued and in-flight jobs to finish
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);

        let dispatcher = self.dispatcher.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Dispatcher terminated abnormally: {e}");
            }
        }
        info!("Job orchestrator stopped");
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SegmentationError::service_unavailable("Service is shutting down"));
        }
        self.worker.model.get().map(|_| ())
    }

    fn resolve_threshold(&self, threshold: Option<f32>) -> Result<f32> {
        NumericValidator::validate_threshold(
            threshold.unwrap_or(self.worker.config.pipeline.default_threshold),
        )
    }

    fn enqueue(&self, snapshot: JobSnapshot) -> Result<JobSnapshot> {
        let id = snapshot.task_id;
        let sent = match self.sender.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|sender| sender.send(id).is_ok()),
            Err(_) => false,
        };
        if !sent {
            if let Err(e) = self.worker.store.fail(&id, "Service is shutting down") {
                warn!(job_id = %id, "Could not fail unqueued task: {e}");
            }
            let _ = self.worker.store.remove(&id);
            return Err(SegmentationError::service_unavailable("Service is shutting down"));
        }
        info!(job_id = %id, source = ?snapshot.source, "Task queued");
        Ok(snapshot)
    }
}

impl Worker {
    /// Hand queued jobs to workers until the channel closes, then wait for
    /// in-flight jobs
    async fn dispatch(self, mut receiver: mpsc::UnboundedReceiver<JobId>, workers: usize) {
        let permits = Arc::new(Semaphore::new(workers));

        while let Some(id) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            tokio::spawn(async move {
                let store = worker.store.clone();
                let outcome = tokio::spawn(worker.run_job(id)).await;
                if let Err(e) = outcome {
                    error!(job_id = %id, "Worker crashed: {e}");
                    if let Err(fail_err) = store.fail(&id, "Processing error: worker crashed") {
                        warn!(job_id = %id, "Could not record worker crash: {fail_err}");
                    }
                }
                drop(permit);
            });
        }

        let total = u32::try_from(workers).unwrap_or(u32::MAX);
        if permits.acquire_many(total).await.is_err() {
            warn!("Worker pool closed while draining");
        }
        debug!("Dispatcher drained");
    }

    /// Run one job to a terminal state
    #[instrument(skip_all, fields(job_id = %id))]
    async fn run_job(self, id: JobId) {
        let payload = match self.store.claim(&id) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Skipping task: {e}");
                return;
            },
        };

        match self.execute(id, payload).await {
            Ok(result) => info!(
                vegetation_percentage = result.vegetation_percentage,
                processing_time = result.processing_time,
                "Task completed"
            ),
            Err(e) => {
                error!(kind = ?e.kind(), "Task failed: {e}");
                if let Err(store_err) = self.store.fail(&id, &e.user_message()) {
                    warn!("Could not record failure: {store_err}");
                }
            },
        }
    }

    async fn execute(&self, id: JobId, payload: JobPayload) -> Result<SegmentationResult> {
        let started = Instant::now();
        let threshold = self.store.snapshot(&id)?.threshold;
        let jobs = &self.config.jobs;

        let mut download_ms = 0;
        let (bytes, extension) = match payload {
            JobPayload::Upload { bytes, extension } => (bytes, extension),
            JobPayload::Url { url } => {
                self.store.transition(
                    &id,
                    JobStatus::Downloading,
                    ProcessingStage::Downloading.description(),
                )?;
                let download_start = Instant::now();
                let fetched = tokio::time::timeout(jobs.fetch_timeout(), self.fetcher.fetch(&url))
                    .await
                    .map_err(|_| {
                        SegmentationError::fetch(format!(
                            "Timed out after {}ms downloading {url}",
                            jobs.fetch_timeout_ms
                        ))
                    })??;
                download_ms = download_start.elapsed().as_millis() as u64;
                (fetched.bytes, fetched.extension)
            },
        };

        self.store
            .transition(&id, JobStatus::Processing, "Processing image")?;
        self.artifacts.save_input(&id, &extension, &bytes).await?;

        let loaded = self.model.get()?;
        let cancel = CancellationToken::new();
        let processor = SegmentationProcessor::new(&loaded, &self.config)?.with_cancellation(cancel.clone());
        let reporter = JobProgressReporter::new(self.store.clone(), id);

        let run = async {
            let mut tracker = ProgressTracker::new(&reporter);
            let mut outcome = processor.segment_bytes(&bytes, threshold, &mut tracker).await?;
            if cancel.is_cancelled() {
                return Err(SegmentationError::processing("Processing cancelled"));
            }

            tracker.report_stage(ProcessingStage::Persisting);
            let persist_start = Instant::now();
            let refs = match self.artifacts.save_artifacts(&id, &outcome.artifacts).await {
                Ok(refs) => refs,
                Err(e) => {
                    tracker.report_error(&e.to_string());
                    return Err(e);
                },
            };
            outcome.timings.persist_ms = persist_start.elapsed().as_millis() as u64;
            tracker.report_completion(&outcome.timings);
            Ok::<_, SegmentationError>((outcome, refs))
        };
        tokio::pin!(run);
        let budget = tokio::time::sleep(jobs.processing_timeout());
        tokio::pin!(budget);

        // The run keeps being polled after the budget expires so patches
        // already on the blocking pool finish before the worker slot frees.
        let (outcome, refs) = tokio::select! {
            finished = &mut run => finished?,
            () = &mut budget => {
                cancel.cancel();
                warn!(budget_ms = jobs.processing_timeout_ms, "Processing budget exceeded, draining in-flight patches");
                if let Err(e) = run.await {
                    debug!("Cancelled run stopped: {e}");
                }
                return Err(SegmentationError::processing(format!(
                    "Processing exceeded the time budget of {}ms",
                    jobs.processing_timeout_ms
                )));
            },
        };

        let mut timings = outcome.timings;
        timings.download_ms = download_ms;
        timings.total_ms = started.elapsed().as_millis() as u64;

        let result = SegmentationResult::new(
            outcome.statistics,
            refs,
            outcome.class_map.dimensions(),
            outcome.patch_count,
            outcome.method,
            timings,
        );
        self.store.complete(&id, result.clone())?;
        Ok(result)
    }
}
