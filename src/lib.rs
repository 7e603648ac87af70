#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # vegseg
//!
//! Vegetation segmentation for aerial and satellite imagery, served as an
//! asynchronous job pipeline.
//!
//! An image is split into fixed-size patches, each patch is classified by a
//! segmentation model, and the per-patch class maps are stitched back into a
//! class map with the exact dimensions of the input. From the class map the
//! service renders a binary vegetation mask, a translucent overlay and a
//! color-coded class visualization, and reports the vegetation percentage.
//!
//! ## Features
//!
//! - **Tiling**: non-overlapping grid with reflect or constant padding
//! - **Backends**: ONNX models through tract (pure Rust), or a weights-free
//!   excess-green heuristic
//! - **Jobs**: bounded worker pool with queued, downloading, processing,
//!   completed and error states, polled by task id
//! - **HTTP service**: upload and URL submission, polling, listing, deletion
//!   and artifact download (enable with `server` feature)
//! - **CLI**: `vegseg serve`, `vegseg segment` and `vegseg config` (enable
//!   with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vegseg::{config::ServiceConfig, segment_image_bytes};
//!
//! # async fn example(bytes: Vec<u8>) -> anyhow::Result<()> {
//! let config = ServiceConfig::load(None)?;
//! let outcome = segment_image_bytes(&bytes, &config, None).await?;
//! println!("{:.2}% vegetation", outcome.statistics.vegetation_percentage);
//! std::fs::write("mask.png", &outcome.artifacts.binary_mask)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Running the service
//!
//! ```rust,no_run
//! use vegseg::{backends, config::ServiceConfig, inference::ModelHandle, jobs::JobOrchestrator};
//!
//! # async fn example(image: Vec<u8>) -> anyhow::Result<()> {
//! let config = ServiceConfig::default();
//! let loaded = backends::load_model(&config)?;
//! let orchestrator = JobOrchestrator::start(config, ModelHandle::ready(loaded.model, loaded.info))?;
//! let accepted = orchestrator.submit_upload("field.jpg", image, Some(0.5))?;
//! let status = orchestrator.status(&accepted.task_id)?;
//! println!("{} at {}%", status.status, status.progress);
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): ONNX inference through tract
//! - `cli` (default): command-line interface
//! - `server` (default): axum HTTP service
//! - `tracing-json`: JSON log output
//! - `webp-support`: WebP input decoding

pub mod api;
pub mod artifacts;
pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod jobs;
pub mod models;
pub mod processor;
pub mod reconstruct;
pub mod services;
pub mod tiler;
pub mod tracing_config;
pub mod types;
pub mod utils;

use services::{NoOpProgressReporter, ProgressTracker};

// Public API exports
pub use api::StatusApi;
pub use artifacts::{ArtifactBuilder, RenderedArtifacts};
pub use backends::{available_backends, load_model, ExcessGreenModel};
pub use config::{
    JobConfig, ModelBackend, ModelConfig, PadMode, PipelineConfig, ServerConfig, ServiceConfig,
    StorageConfig, TensorLayout,
};
pub use download::{FetchedImage, HttpImageFetcher, ImageFetcher};
pub use error::{ErrorKind, Result, SegmentationError};
pub use inference::{InferenceAdapter, LoadedModel, ModelHandle, PatchPrediction, SegmentationModel};
pub use jobs::{JobId, JobOrchestrator, JobSnapshot, JobSource, JobStatus, JobStore};
pub use models::{ModelInfo, ModelManager, PreprocessingConfig};
pub use processor::{SegmentationOutcome, SegmentationProcessor};
pub use reconstruct::Reconstructor;
pub use services::{
    ArtifactStore, ConsoleProgressReporter, ImageIOService, ProcessingStage, ProgressReporter,
    ProgressUpdate,
};
pub use tiler::{Patch, PatchSpec, TileGrid, Tiler, ValidRegion};
pub use tracing_config::{TracingConfig, TracingFormat};
pub use types::{ArtifactRefs, ClassMap, ClassMapStatistics, ProcessingTimings, SegmentationResult};
pub use utils::{NumericValidator, PathValidator, TensorValidator};

#[cfg(feature = "tract")]
pub use backends::TractSegmentationModel;

/// Segment an encoded image in the foreground
///
/// Loads the model selected by `config`, runs the full pipeline and returns
/// the class map, metrics and encoded artifacts. Nothing is written to disk.
/// `threshold` defaults to the pipeline's default threshold.
///
/// # Errors
/// - Model loading failures
/// - `Decode` for unusable image bytes
/// - Pipeline failures as for [`SegmentationProcessor::segment`]
pub async fn segment_image_bytes(
    bytes: &[u8],
    config: &ServiceConfig,
    threshold: Option<f32>,
) -> Result<SegmentationOutcome> {
    let loaded = load_model(config)?;
    let processor = SegmentationProcessor::new(&loaded, config)?;
    let reporter = NoOpProgressReporter;
    let mut tracker = ProgressTracker::new(&reporter);
    processor
        .segment_bytes(
            bytes,
            threshold.unwrap_or(config.pipeline.default_threshold),
            &mut tracker,
        )
        .await
}

/// Segment an image read from an async stream
///
/// # Errors
/// - `Io` when the stream cannot be read
/// - As [`segment_image_bytes`]
pub async fn segment_from_reader<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    config: &ServiceConfig,
    threshold: Option<f32>,
) -> Result<SegmentationOutcome> {
    let mut buffer = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buffer).await?;
    segment_image_bytes(&buffer, config, threshold).await
}
