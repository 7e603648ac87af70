//! Configuration types for the segmentation service
//!
//! Every section has serde defaults so a partial JSON file (or none at all)
//! yields a runnable configuration. [`ServiceConfig::validate`] rejects values
//! the pipeline cannot honor.

use crate::error::{Result, SegmentationError};
use crate::models::PreprocessingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "VEGSEG_CONFIG";

/// Padding applied to patches that extend past the image border
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PadMode {
    /// Mirror the image about its border without repeating the edge sample
    Reflect,
    /// Fill with a constant sample value
    Constant(u8),
}

impl Default for PadMode {
    fn default() -> Self {
        Self::Reflect
    }
}

impl std::fmt::Display for PadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reflect => write!(f, "reflect"),
            Self::Constant(value) => write!(f, "constant({value})"),
        }
    }
}

/// Memory layout of the model's input and output tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// Batch, channels, height, width
    Nchw,
    /// Batch, height, width, channels (Keras exports)
    Nhwc,
}

impl Default for TensorLayout {
    fn default() -> Self {
        Self::Nhwc
    }
}

/// Which model implementation backs the inference adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelBackend {
    /// ONNX model executed with tract
    Tract,
    /// Weights-free excess-green classifier
    Heuristic,
}

impl Default for ModelBackend {
    fn default() -> Self {
        if cfg!(feature = "tract") {
            Self::Tract
        } else {
            Self::Heuristic
        }
    }
}

impl std::fmt::Display for ModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tract => write!(f, "tract"),
            Self::Heuristic => write!(f, "heuristic"),
        }
    }
}

/// Tiling, inference and labeling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Patch edge length in pixels
    pub patch_size: u32,
    /// Padding policy for border patches
    pub pad_mode: PadMode,
    /// Number of classes the model predicts
    pub num_classes: u8,
    /// Label treated as non-vegetation
    pub background_class: u8,
    /// Maximum patches in flight per job (0 = available parallelism)
    pub inference_parallelism: usize,
    /// Threshold used when a submission does not carry one
    pub default_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            patch_size: 512,
            pad_mode: PadMode::Reflect,
            num_classes: 7,
            background_class: 0,
            inference_parallelism: 0,
            default_threshold: 0.5,
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline configuration builder
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Patch concurrency with the `0 = auto` rule resolved
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        if self.inference_parallelism == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            self.inference_parallelism
        }
    }

    /// Validate the pipeline parameters
    ///
    /// # Errors
    /// - Patch size of zero or above 4096
    /// - Fewer than two classes, or a background class outside the class range
    /// - Default threshold outside `[0, 1]`
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.patch_size > 4096 {
            return Err(SegmentationError::config_value_error(
                "patch_size",
                self.patch_size,
                "1-4096",
                Some(512),
            ));
        }
        if self.num_classes < 2 {
            return Err(SegmentationError::config_value_error(
                "num_classes",
                self.num_classes,
                "2-255",
                Some(7),
            ));
        }
        if self.background_class >= self.num_classes {
            return Err(SegmentationError::config_value_error(
                "background_class",
                u32::from(self.background_class),
                &format!("0-{}", self.num_classes - 1),
                Some(0),
            ));
        }
        crate::utils::NumericValidator::validate_threshold(self.default_threshold)
            .map_err(|e| SegmentationError::invalid_config(format!("default_threshold: {e}")))?;
        Ok(())
    }
}

/// Builder for [`PipelineConfig`]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn patch_size(mut self, patch_size: u32) -> Self {
        self.config.patch_size = patch_size;
        self
    }

    #[must_use]
    pub fn pad_mode(mut self, pad_mode: PadMode) -> Self {
        self.config.pad_mode = pad_mode;
        self
    }

    #[must_use]
    pub fn num_classes(mut self, num_classes: u8) -> Self {
        self.config.num_classes = num_classes;
        self
    }

    #[must_use]
    pub fn background_class(mut self, background_class: u8) -> Self {
        self.config.background_class = background_class;
        self
    }

    #[must_use]
    pub fn inference_parallelism(mut self, parallelism: usize) -> Self {
        self.config.inference_parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn default_threshold(mut self, threshold: f32) -> Self {
        self.config.default_threshold = threshold;
        self
    }

    /// Build the pipeline configuration
    ///
    /// # Errors
    /// Returns `InvalidConfig` when [`PipelineConfig::validate`] fails
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Job queue, worker pool and submission limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of jobs processed concurrently
    pub workers: usize,
    /// Upper bound on the downloading stage
    pub fetch_timeout_ms: u64,
    /// Upper bound on the processing stage
    pub processing_timeout_ms: u64,
    /// Largest accepted upload
    pub max_upload_bytes: usize,
    /// Largest accepted remote image
    pub max_download_bytes: usize,
    /// Accepted upload file extensions (lowercase, without the dot)
    pub allowed_extensions: Vec<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            fetch_timeout_ms: 30_000,
            processing_timeout_ms: 600_000,
            max_upload_bytes: 50 * 1024 * 1024,
            max_download_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["jpg", "jpeg", "png", "tif", "tiff"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl JobConfig {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    #[must_use]
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    /// Validate the job limits
    ///
    /// # Errors
    /// Returns `InvalidConfig` for zero workers, zero timeouts or zero size limits
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > 64 {
            return Err(SegmentationError::config_value_error(
                "workers",
                self.workers,
                "1-64",
                Some(2),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(SegmentationError::invalid_config(
                "fetch_timeout_ms must be greater than zero",
            ));
        }
        if self.processing_timeout_ms == 0 {
            return Err(SegmentationError::invalid_config(
                "processing_timeout_ms must be greater than zero",
            ));
        }
        if self.max_upload_bytes == 0 || self.max_download_bytes == 0 {
            return Err(SegmentationError::invalid_config(
                "size limits must be greater than zero",
            ));
        }
        if self.allowed_extensions.is_empty() {
            return Err(SegmentationError::invalid_config(
                "allowed_extensions must not be empty",
            ));
        }
        Ok(())
    }
}

/// Where inputs and artifacts are written and how artifacts are addressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub results_dir: PathBuf,
    pub uploads_dir: PathBuf,
    /// URL prefix under which `results_dir` is served
    pub results_url_prefix: String,
    /// Keep the submitted image next to the artifacts
    pub keep_inputs: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            uploads_dir: PathBuf::from("uploads"),
            results_url_prefix: "/results".to_string(),
            keep_inputs: true,
        }
    }
}

/// Model selection and loading parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    /// ONNX model file (tract backend only)
    pub path: PathBuf,
    /// Expected SHA-256 of the model file, lowercase hex
    pub sha256: Option<String>,
    pub layout: TensorLayout,
    /// Apply softmax to the model output (exports without a final activation)
    pub softmax: bool,
    pub preprocessing: PreprocessingConfig,
    /// Human-readable encoder name reported by the info endpoint
    pub backbone: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: ModelBackend::default(),
            path: PathBuf::from("models/model.onnx"),
            sha256: None,
            layout: TensorLayout::Nhwc,
            softmax: false,
            preprocessing: PreprocessingConfig::default(),
            backbone: "resnet34".to_string(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Allow any origin (the browser front-end is served separately)
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_permissive: true,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub pipeline: PipelineConfig,
    pub jobs: JobConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub server: ServerConfig,
}

impl ServiceConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON for this schema
    /// - Loaded values fail validation
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SegmentationError::file_io_error("read config file", path, &e))?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            SegmentationError::invalid_config(format!(
                "Failed to parse config '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by an explicit path, else `VEGSEG_CONFIG`, else defaults
    ///
    /// # Errors
    /// Propagates [`ServiceConfig::from_json_file`] failures
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_json_file(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::from_json_file(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    /// Validate every section
    ///
    /// # Errors
    /// Returns the first `InvalidConfig` found
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.jobs.validate()?;
        self.model.preprocessing.validate()?;
        if self.storage.results_url_prefix.ends_with('/') {
            return Err(SegmentationError::invalid_config(
                "results_url_prefix must not end with '/'",
            ));
        }
        Ok(())
    }

    /// Serialize as pretty JSON
    ///
    /// # Errors
    /// Serialization failure (not expected for this schema)
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SegmentationError::internal(format!("Failed to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.patch_size, 512);
        assert_eq!(config.pipeline.num_classes, 7);
        assert_eq!(config.jobs.fetch_timeout(), Duration::from_secs(30));
        assert_eq!(config.jobs.max_upload_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn test_pipeline_builder_chain() {
        let config = PipelineConfig::builder()
            .patch_size(256)
            .pad_mode(PadMode::Constant(0))
            .inference_parallelism(4)
            .build()
            .unwrap();

        assert_eq!(config.patch_size, 256);
        assert_eq!(config.pad_mode, PadMode::Constant(0));
        assert_eq!(config.effective_parallelism(), 4);
    }

    #[test]
    fn test_pipeline_builder_rejects_bad_values() {
        let err = PipelineConfig::builder().patch_size(0).build().unwrap_err();
        assert!(err.to_string().contains("patch_size"));

        let err = PipelineConfig::builder()
            .num_classes(3)
            .background_class(3)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("background_class"));

        assert!(PipelineConfig::builder()
            .default_threshold(1.5)
            .build()
            .is_err());
    }

    #[test]
    fn test_job_config_validation() {
        let mut jobs = JobConfig::default();
        jobs.workers = 0;
        let err = jobs.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));

        let mut jobs = JobConfig::default();
        jobs.fetch_timeout_ms = 0;
        assert!(jobs.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"jobs": {{"workers": 4}}, "pipeline": {{"pad_mode": {{"constant": 0}}}}}}"#
        )
        .unwrap();

        let config = ServiceConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.jobs.workers, 4);
        assert_eq!(config.jobs.fetch_timeout_ms, 30_000);
        assert_eq!(config.pipeline.pad_mode, PadMode::Constant(0));
        assert_eq!(config.pipeline.patch_size, 512);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = ServiceConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, SegmentationError::InvalidConfig(_)));
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = ServiceConfig::default();
        let json = config.to_json_pretty().unwrap();
        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
