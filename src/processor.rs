//! Segmentation pipeline for a single image
//!
//! `SegmentationProcessor` runs decode, tiling, per-patch inference,
//! reconstruction and artifact rendering. It is shared by the job workers
//! and the CLI so both produce identical results. Persistence is left to the
//! caller.

use crate::{
    artifacts::{ArtifactBuilder, RenderedArtifacts},
    config::ServiceConfig,
    error::{Result, SegmentationError},
    inference::{InferenceAdapter, LoadedModel, PatchPrediction},
    reconstruct::Reconstructor,
    services::{ImageIOService, ProcessingStage, ProgressTracker},
    tiler::Tiler,
    types::{ClassMap, ClassMapStatistics, ProcessingTimings},
    utils::NumericValidator,
};
use futures::stream::{self, StreamExt};
use image::RgbImage;
use instant::Instant;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Everything a successful run produced
#[derive(Debug, Clone)]
pub struct SegmentationOutcome {
    pub class_map: ClassMap,
    pub statistics: ClassMapStatistics,
    pub artifacts: RenderedArtifacts,
    pub timings: ProcessingTimings,
    pub patch_count: usize,
    /// Model description recorded as the result's method
    pub method: String,
}

impl SegmentationOutcome {
    /// `(height, width)` of the source image
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        self.class_map.dimensions()
    }
}

/// Runs the segmentation pipeline with a loaded model
#[derive(Clone)]
pub struct SegmentationProcessor {
    adapter: InferenceAdapter,
    tiler: Tiler,
    reconstructor: Reconstructor,
    artifact_builder: ArtifactBuilder,
    parallelism: usize,
    method: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SegmentationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationProcessor")
            .field("method", &self.method)
            .field("patch_size", &self.tiler.patch_size())
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl SegmentationProcessor {
    /// Build a processor for `model` using the pipeline and model settings
    ///
    /// # Errors
    /// - Invalid pipeline configuration
    /// - Model class count differing from the pipeline's
    pub fn new(model: &LoadedModel, config: &ServiceConfig) -> Result<Self> {
        config.pipeline.validate()?;

        let adapter = InferenceAdapter::new(
            Arc::clone(&model.model),
            &config.pipeline,
            config.model.preprocessing.clone(),
        )?
        .with_softmax(config.model.softmax);

        Ok(Self {
            adapter,
            tiler: Tiler::from_config(&config.pipeline)?,
            reconstructor: Reconstructor::new(),
            artifact_builder: ArtifactBuilder::new(config.pipeline.background_class),
            parallelism: config.pipeline.effective_parallelism().max(1),
            method: format!("{} ({} classes)", model.info.name, model.info.num_classes),
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the run when `token` is cancelled
    ///
    /// No new patches are dispatched after cancellation, and patches already
    /// on the blocking pool are awaited before the run returns an error.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.tiler.patch_size()
    }

    /// Decode `bytes` and segment the image
    ///
    /// # Errors
    /// `Decode` for unusable bytes, otherwise as [`Self::segment`]
    pub async fn segment_bytes(
        &self,
        bytes: &[u8],
        threshold: f32,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<SegmentationOutcome> {
        tracker.report_stage(ProcessingStage::Decoding);
        let decode_start = Instant::now();
        let image = match ImageIOService::load_from_bytes(bytes) {
            Ok(image) => image,
            Err(e) => {
                tracker.report_error(&e.to_string());
                return Err(e);
            },
        };
        let decode_ms = decode_start.elapsed().as_millis() as u64;
        debug!(decode_ms, width = image.width(), height = image.height(), "Image decoded");

        let mut outcome = self.segment(Arc::new(image), threshold, tracker).await?;
        outcome.timings.decode_ms = decode_ms;
        outcome.timings.total_ms += decode_ms;
        Ok(outcome)
    }

    /// Segment a decoded image
    ///
    /// Progress is reported per stage, and per patch during inference.
    ///
    /// # Errors
    /// - `Validation` for a threshold outside `[0, 1]`
    /// - `Inference` when the model fails, returns a malformed output, or panics
    /// - `Reconstruction` when patch outputs do not assemble
    /// - `Processing` when the run was cancelled
    #[instrument(
        skip(self, image, tracker),
        fields(
            method = %self.method,
            dimensions = %format!("{}x{}", image.width(), image.height())
        )
    )]
    pub async fn segment(
        &self,
        image: Arc<RgbImage>,
        threshold: f32,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<SegmentationOutcome> {
        let result = self.run(image, threshold, tracker).await;
        if let Err(e) = &result {
            tracker.report_error(&e.to_string());
        }
        result
    }

    async fn run(
        &self,
        image: Arc<RgbImage>,
        threshold: f32,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<SegmentationOutcome> {
        let threshold = NumericValidator::validate_threshold(threshold)?;
        let total_start = Instant::now();
        let mut timings = ProcessingTimings::default();

        tracker.report_stage(ProcessingStage::Tiling);
        let tiling_start = Instant::now();
        let (grid, patches) = self.tiler.tile_image(&image)?;
        timings.tiling_ms = tiling_start.elapsed().as_millis() as u64;
        let patch_count = grid.patch_count();
        debug!(patch_count, grid = ?grid.shape(), "Image tiled");

        let inference_start = Instant::now();
        let predictions = self.classify_patches(patches, threshold, tracker).await?;
        timings.inference_ms = inference_start.elapsed().as_millis() as u64;

        tracker.report_stage(ProcessingStage::Reconstruction);
        let reconstruction_start = Instant::now();
        let reconstructor = self.reconstructor;
        let class_map = tokio::task::spawn_blocking(move || reconstructor.reconstruct(&grid, &predictions))
            .await
            .map_err(|e| Self::join_error("reconstruction", e))??;
        timings.reconstruction_ms = reconstruction_start.elapsed().as_millis() as u64;
        self.ensure_active()?;

        tracker.report_stage(ProcessingStage::Artifacts);
        let artifacts_start = Instant::now();
        let builder = self.artifact_builder.clone();
        let source = Arc::clone(&image);
        let map = class_map.clone();
        let (statistics, artifacts) = tokio::task::spawn_blocking(move || builder.build(&source, &map))
            .await
            .map_err(|e| Self::join_error("artifact rendering", e))??;
        timings.artifacts_ms = artifacts_start.elapsed().as_millis() as u64;
        timings.total_ms = total_start.elapsed().as_millis() as u64;

        info!(
            vegetation_percentage = statistics.vegetation_percentage,
            classes = ?statistics.unique_classes,
            patch_count,
            total_ms = timings.total_ms,
            "Segmentation finished"
        );

        Ok(SegmentationOutcome {
            class_map,
            statistics,
            artifacts,
            timings,
            patch_count,
            method: self.method.clone(),
        })
    }

    /// Classify patches on the blocking pool, at most `parallelism` at a time
    async fn classify_patches(
        &self,
        patches: Vec<crate::tiler::Patch>,
        threshold: f32,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<Vec<PatchPrediction>> {
        let total = patches.len();
        tracker.report_patches(0, total);

        // A failed patch stops dispatch for this run only
        let stop = self.cancel.child_token();
        let mut pending = stream::iter(patches)
            .map(|patch| {
                let adapter = self.adapter.clone();
                let stop = stop.clone();
                async move {
                    if stop.is_cancelled() {
                        return None;
                    }
                    Some(tokio::task::spawn_blocking(move || adapter.classify(&patch, threshold)).await)
                }
            })
            .buffer_unordered(self.parallelism);

        let mut predictions = Vec::with_capacity(total);
        let mut failure = None;
        while let Some(joined) = pending.next().await {
            let Some(joined) = joined else {
                continue;
            };
            match joined.map_err(|e| Self::join_error("inference", e)).and_then(|r| r) {
                Ok(prediction) => {
                    if failure.is_none() {
                        predictions.push(prediction);
                        tracker.report_patches(predictions.len(), total);
                    }
                },
                Err(e) => {
                    if failure.is_none() {
                        stop.cancel();
                        failure = Some(e);
                    }
                },
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        self.ensure_active()?;
        Ok(predictions)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SegmentationError::processing("Processing cancelled"))
        } else {
            Ok(())
        }
    }

    fn join_error(stage: &str, error: JoinError) -> SegmentationError {
        if error.is_panic() {
            let payload = error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            if stage == "inference" {
                SegmentationError::inference(format!("Model panicked: {message}"))
            } else {
                SegmentationError::internal(format!("{stage} task panicked: {message}"))
            }
        } else {
            SegmentationError::internal(format!("{stage} task was cancelled"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{self, FailingModel, FixedClassModel, PanickingModel};
    use crate::config::{ModelConfig, PipelineConfig, TensorLayout};
    use crate::inference::SegmentationModel;
    use crate::services::{NoOpProgressReporter, ProgressReporter, ProgressUpdate};
    use image::Rgb;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ErrorLog(Mutex<Vec<(ProcessingStage, String)>>);

    impl ProgressReporter for ErrorLog {
        fn report_progress(&self, _update: ProgressUpdate) {}

        fn report_completion(&self, _timings: &ProcessingTimings) {}

        fn report_error(&self, stage: ProcessingStage, error: &str) {
            self.0.lock().unwrap().push((stage, error.to_string()));
        }
    }

    fn config(patch_size: u32) -> ServiceConfig {
        ServiceConfig {
            pipeline: PipelineConfig {
                patch_size,
                inference_parallelism: 2,
                ..PipelineConfig::default()
            },
            model: ModelConfig::default(),
            ..ServiceConfig::default()
        }
    }

    fn loaded(model: Arc<dyn SegmentationModel>, patch_size: u32) -> LoadedModel {
        let info = mock::info_for(model.as_ref(), patch_size);
        LoadedModel { model, info }
    }

    #[tokio::test]
    async fn test_segment_fixed_vegetation() {
        let model = Arc::new(FixedClassModel::new(7, 3, TensorLayout::Nhwc));
        let processor = SegmentationProcessor::new(&loaded(model.clone(), 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let image = Arc::new(RgbImage::from_pixel(20, 10, Rgb([1, 2, 3])));
        let outcome = processor.segment(image, 0.5, &mut tracker).await.unwrap();

        assert_eq!(outcome.dimensions(), (10, 20));
        assert_eq!(outcome.patch_count, 6);
        assert_eq!(model.call_count(), 6);
        assert_eq!(outcome.statistics.vegetation_percentage, 100.0);
        assert_eq!(outcome.statistics.unique_classes, vec![3]);
    }

    #[tokio::test]
    async fn test_invalid_threshold_rejected() {
        let model = Arc::new(FixedClassModel::new(7, 0, TensorLayout::Nhwc));
        let processor = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let image = Arc::new(RgbImage::new(4, 4));
        let err = processor.segment(image, 1.5, &mut tracker).await.unwrap_err();
        assert!(matches!(err, SegmentationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_model_failure_is_inference_error() {
        let model = Arc::new(FailingModel::new(7, "weights corrupted"));
        let processor = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let err = processor
            .segment(Arc::new(RgbImage::new(8, 8)), 0.5, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Inference(_)));
        assert!(err.to_string().contains("weights corrupted"));
    }

    #[tokio::test]
    async fn test_model_panic_is_inference_error() {
        let model = Arc::new(PanickingModel::new(7));
        let processor = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let err = processor
            .segment(Arc::new(RgbImage::new(8, 8)), 0.5, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Inference(_)));
    }

    #[tokio::test]
    async fn test_segment_bytes_rejects_garbage() {
        let model = Arc::new(FixedClassModel::new(7, 0, TensorLayout::Nhwc));
        let processor = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let err = processor
            .segment_bytes(b"not an image", 0.5, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Decode(_)));
    }

    #[test]
    fn test_class_count_mismatch_rejected() {
        let model = Arc::new(FixedClassModel::new(3, 0, TensorLayout::Nhwc));
        let err = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap_err();
        assert!(matches!(err, SegmentationError::Model(_)));
    }

    #[tokio::test]
    async fn test_failures_are_reported_against_their_stage() {
        let model = Arc::new(FailingModel::new(7, "weights corrupted"));
        let processor = SegmentationProcessor::new(&loaded(model, 8), &config(8)).unwrap();
        let reporter = ErrorLog::default();

        let mut tracker = ProgressTracker::new(&reporter);
        processor
            .segment(Arc::new(RgbImage::new(8, 8)), 0.5, &mut tracker)
            .await
            .unwrap_err();
        let mut tracker = ProgressTracker::new(&reporter);
        processor
            .segment_bytes(b"not an image", 0.5, &mut tracker)
            .await
            .unwrap_err();

        let errors = reporter.0.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0, ProcessingStage::Inference);
        assert!(errors[0].1.contains("weights corrupted"));
        assert_eq!(errors[1].0, ProcessingStage::Decoding);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_no_patches() {
        let model = Arc::new(FixedClassModel::new(7, 3, TensorLayout::Nhwc));
        let token = CancellationToken::new();
        let processor = SegmentationProcessor::new(&loaded(model.clone(), 8), &config(8))
            .unwrap()
            .with_cancellation(token.clone());
        token.cancel();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let err = processor
            .segment(Arc::new(RgbImage::new(24, 16)), 0.5, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Processing(_)));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_patch_waits_for_in_flight_patches() {
        let slow = Arc::new(crate::backends::mock::SlowModel::new(
            Arc::new(FailingModel::new(7, "boom")),
            std::time::Duration::from_millis(30),
        ));
        let processor = SegmentationProcessor::new(&loaded(slow.clone(), 8), &config(8)).unwrap();
        let reporter = NoOpProgressReporter;
        let mut tracker = ProgressTracker::new(&reporter);

        let err = processor
            .segment(Arc::new(RgbImage::new(32, 32)), 0.5, &mut tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Inference(_)));
        assert_eq!(slow.in_flight(), 0);
        assert!(slow.call_count() < 16);
    }
}
