//! Progress reporting service
//!
//! Separates progress reporting from the pipeline so the job orchestrator,
//! the CLI and tests can each observe a run in their own way.

use crate::types::ProcessingTimings;
use instant::Instant;
use serde::Serialize;

/// Progress at the start of per-patch inference
pub const INFERENCE_START_PROGRESS: u8 = 25;

/// Progress once every patch has been classified
pub const INFERENCE_END_PROGRESS: u8 = 85;

/// Stages a segmentation job moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Accepted and waiting for a worker
    Queued,
    /// Fetching the source image
    Downloading,
    /// Decoding bytes into pixels
    Decoding,
    /// Cutting the image into patches
    Tiling,
    /// Classifying patches
    Inference,
    /// Stitching patch labels into the class map
    Reconstruction,
    /// Computing metrics and rendering images
    Artifacts,
    /// Writing artifacts to storage
    Persisting,
    /// Finished
    Completed,
}

impl ProcessingStage {
    /// Human-readable description, used as the job message
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            ProcessingStage::Queued => "Task queued for processing",
            ProcessingStage::Downloading => "Downloading image",
            ProcessingStage::Decoding => "Decoding image",
            ProcessingStage::Tiling => "Splitting image into patches",
            ProcessingStage::Inference => "Running segmentation model",
            ProcessingStage::Reconstruction => "Reconstructing segmentation map",
            ProcessingStage::Artifacts => "Computing metrics and rendering results",
            ProcessingStage::Persisting => "Saving results",
            ProcessingStage::Completed => "Segmentation completed",
        }
    }

    /// Progress percentage on entering this stage
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            ProcessingStage::Queued => 0,
            ProcessingStage::Downloading => 10,
            ProcessingStage::Decoding => 20,
            ProcessingStage::Tiling | ProcessingStage::Inference => INFERENCE_START_PROGRESS,
            ProcessingStage::Reconstruction => 88,
            ProcessingStage::Artifacts => 92,
            ProcessingStage::Persisting => 96,
            ProcessingStage::Completed => 100,
        }
    }
}

/// Progress within the inference stage after `completed` of `total` patches
#[must_use]
pub fn inference_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return INFERENCE_END_PROGRESS;
    }
    let span = usize::from(INFERENCE_END_PROGRESS - INFERENCE_START_PROGRESS);
    let done = completed.min(total);
    let step = u8::try_from(span * done / total).unwrap_or(0);
    INFERENCE_START_PROGRESS + step
}

/// Progress update containing stage and timing information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: ProcessingStage,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub description: String,
    /// Elapsed time since processing started (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(stage: ProcessingStage, start_time: Instant) -> Self {
        Self {
            progress: stage.progress_percentage(),
            description: stage.description().to_string(),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            stage,
        }
    }

    /// Inference update after `completed` of `total` patches
    #[must_use]
    pub fn inference(completed: usize, total: usize, start_time: Instant) -> Self {
        Self {
            stage: ProcessingStage::Inference,
            progress: inference_progress(completed, total),
            description: format!("Running segmentation model ({completed}/{total} patches)"),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        }
    }
}

/// Receives progress from a pipeline run
pub trait ProgressReporter: Send + Sync {
    /// Report a progress update
    fn report_progress(&self, update: ProgressUpdate);

    /// Report completion with final timings
    fn report_completion(&self, timings: &ProcessingTimings);

    /// Report an error in `stage`
    fn report_error(&self, stage: ProcessingStage, error: &str);
}

/// Discards all progress updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _timings: &ProcessingTimings) {}

    fn report_error(&self, _stage: ProcessingStage, _error: &str) {}
}

/// Logs progress through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            tracing::info!(
                "[{}%] {} ({}ms elapsed)",
                update.progress,
                update.description,
                update.elapsed_ms
            );
        } else {
            tracing::debug!("[{}%] {}", update.progress, update.description);
        }
    }

    fn report_completion(&self, timings: &ProcessingTimings) {
        tracing::info!("Segmentation completed in {}ms", timings.total_ms);
        if self.verbose {
            tracing::info!("  {}", timings.summary());
        }
    }

    fn report_error(&self, stage: ProcessingStage, error: &str) {
        tracing::error!("Error during {}: {}", stage.description(), error);
    }
}

/// Tracks the current stage and forwards updates to a reporter
pub struct ProgressTracker<'a> {
    reporter: &'a dyn ProgressReporter,
    start_time: Instant,
    current_stage: ProcessingStage,
}

impl<'a> ProgressTracker<'a> {
    #[must_use]
    pub fn new(reporter: &'a dyn ProgressReporter) -> Self {
        Self {
            reporter,
            start_time: Instant::now(),
            current_stage: ProcessingStage::Queued,
        }
    }

    pub fn report_stage(&mut self, stage: ProcessingStage) {
        self.current_stage = stage;
        self.reporter
            .report_progress(ProgressUpdate::new(stage, self.start_time));
    }

    /// Report that `completed` of `total` patches are classified
    pub fn report_patches(&mut self, completed: usize, total: usize) {
        self.current_stage = ProcessingStage::Inference;
        self.reporter
            .report_progress(ProgressUpdate::inference(completed, total, self.start_time));
    }

    pub fn report_completion(&self, timings: &ProcessingTimings) {
        self.reporter.report_completion(timings);
    }

    /// Report an error against the current stage
    pub fn report_error(&self, error: &str) {
        self.reporter.report_error(self.current_stage, error);
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    #[must_use]
    pub fn current_stage(&self) -> ProcessingStage {
        self.current_stage
    }

    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        updates: Mutex<Vec<ProgressUpdate>>,
        errors: Mutex<Vec<(ProcessingStage, String)>>,
    }

    impl ProgressReporter for RecordingReporter {
        fn report_progress(&self, update: ProgressUpdate) {
            self.updates.lock().unwrap().push(update);
        }

        fn report_completion(&self, _timings: &ProcessingTimings) {}

        fn report_error(&self, stage: ProcessingStage, error: &str) {
            self.errors.lock().unwrap().push((stage, error.to_string()));
        }
    }

    #[test]
    fn test_stage_percentages_are_ordered() {
        let stages = [
            ProcessingStage::Queued,
            ProcessingStage::Downloading,
            ProcessingStage::Decoding,
            ProcessingStage::Tiling,
            ProcessingStage::Inference,
            ProcessingStage::Reconstruction,
            ProcessingStage::Artifacts,
            ProcessingStage::Persisting,
            ProcessingStage::Completed,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].progress_percentage() <= pair[1].progress_percentage());
        }
        assert_eq!(ProcessingStage::Completed.progress_percentage(), 100);
    }

    #[test]
    fn test_inference_progress_bounds() {
        assert_eq!(inference_progress(0, 4), 25);
        assert_eq!(inference_progress(2, 4), 55);
        assert_eq!(inference_progress(4, 4), 85);
        assert_eq!(inference_progress(9, 4), 85);
        assert_eq!(inference_progress(0, 0), 85);
        assert!(inference_progress(4, 4) < ProcessingStage::Reconstruction.progress_percentage());
    }

    #[test]
    fn test_tracker_forwards_updates_and_errors() {
        let reporter = RecordingReporter::default();
        let mut tracker = ProgressTracker::new(&reporter);

        tracker.report_stage(ProcessingStage::Decoding);
        tracker.report_patches(1, 2);
        tracker.report_error("boom");

        let updates = reporter.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].progress, 20);
        assert_eq!(updates[1].progress, 55);
        assert!(updates[1].description.contains("1/2"));

        let errors = reporter.errors.lock().unwrap();
        assert_eq!(errors[0], (ProcessingStage::Inference, "boom".to_string()));
    }

    #[test]
    fn test_no_op_reporter() {
        let reporter = NoOpProgressReporter;
        reporter.report_progress(ProgressUpdate::new(ProcessingStage::Inference, Instant::now()));
        reporter.report_completion(&ProcessingTimings::default());
        reporter.report_error(ProcessingStage::Inference, "ignored");
    }
}
