//! Model metadata, preprocessing parameters and model file management

use crate::config::{ModelBackend, ModelConfig, PipelineConfig, TensorLayout};
use crate::error::{Result, SegmentationError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-channel normalization applied to patch samples before inference
///
/// A sample `x` in `0..=255` becomes `(x / 255 - mean[c]) / std[c]`. The
/// defaults are the ImageNet statistics used by ResNet encoders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessingConfig {
    /// Identity normalization (`x / 255`)
    #[must_use]
    pub fn unit_scale() -> Self {
        Self {
            normalization_mean: [0.0; 3],
            normalization_std: [1.0; 3],
        }
    }

    /// Validate that every channel can be normalized
    ///
    /// # Errors
    /// Returns `InvalidConfig` for non-finite values or non-positive std
    pub fn validate(&self) -> Result<()> {
        for (channel, (mean, std)) in self
            .normalization_mean
            .iter()
            .zip(self.normalization_std.iter())
            .enumerate()
        {
            if !mean.is_finite() || !std.is_finite() || *std <= 0.0 {
                return Err(SegmentationError::invalid_config(format!(
                    "Invalid normalization for channel {channel}: mean={mean}, std={std}"
                )));
            }
        }
        Ok(())
    }
}

/// Model information and metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub backend: ModelBackend,
    pub size_bytes: usize,
    /// Square patch edge the model expects
    pub input_size: u32,
    pub num_classes: u8,
    pub layout: TensorLayout,
}

/// Resolves, verifies and reads model files
#[derive(Debug, Clone)]
pub struct ModelManager {
    config: ModelConfig,
}

impl ModelManager {
    #[must_use]
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Per-user fallback location for model files
    #[must_use]
    pub fn default_model_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("vegseg").join("models"))
    }

    /// Locate the model file
    ///
    /// The configured path wins; a relative path that does not exist is also
    /// looked up by file name in [`ModelManager::default_model_dir`].
    ///
    /// # Errors
    /// Returns `Model` when no candidate exists
    pub fn resolve_path(&self) -> Result<PathBuf> {
        let configured = &self.config.path;
        if configured.exists() {
            return Ok(configured.clone());
        }

        if configured.is_relative() {
            if let (Some(dir), Some(name)) = (Self::default_model_dir(), configured.file_name()) {
                let candidate = dir.join(name);
                if candidate.exists() {
                    log::debug!("Using model from data directory: {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }

        Err(SegmentationError::model(format!(
            "Model file not found: {}",
            configured.display()
        )))
    }

    /// Read the model bytes, verifying the configured checksum
    ///
    /// # Errors
    /// - Model file missing or unreadable
    /// - SHA-256 mismatch
    pub fn load_model(&self) -> Result<Vec<u8>> {
        let path = self.resolve_path()?;
        let data = fs::read(&path)
            .map_err(|e| SegmentationError::file_io_error("read model file", &path, &e))?;

        if let Some(expected) = &self.config.sha256 {
            let actual = sha256_hex(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SegmentationError::model(format!(
                    "Checksum mismatch for '{}': expected {}, got {}",
                    path.display(),
                    expected,
                    actual
                )));
            }
            log::debug!("Model checksum verified for {}", path.display());
        }

        Ok(data)
    }

    /// Build the metadata reported for a loaded model
    #[must_use]
    pub fn describe(&self, pipeline: &PipelineConfig, size_bytes: usize) -> ModelInfo {
        let name = match self.config.backend {
            ModelBackend::Tract => file_stem(&self.config.path),
            ModelBackend::Heuristic => "excess-green".to_string(),
        };
        ModelInfo {
            name,
            backend: self.config.backend,
            size_bytes,
            input_size: pipeline.patch_size,
            num_classes: pipeline.num_classes,
            layout: self.config.layout,
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "model".to_string(), |s| s.to_string_lossy().into_owned())
}

/// Lowercase hex SHA-256 of a byte slice
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
