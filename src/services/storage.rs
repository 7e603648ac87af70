//! Artifact and input persistence
//!
//! Files for a job share the `{job_id}_` prefix, which is what deletion keys on.

use crate::{
    artifacts::RenderedArtifacts,
    config::StorageConfig,
    error::{Result, SegmentationError},
    types::ArtifactRefs,
    utils::PathValidator,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// File names of the three artifacts for a job
#[must_use]
pub fn artifact_names(job_id: &Uuid) -> [String; 3] {
    [
        format!("{job_id}_result.png"),
        format!("{job_id}_overlay.png"),
        format!("{job_id}_segmentation.png"),
    ]
}

/// Reads and writes job files below the configured directories
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    config: StorageConfig,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create the results and uploads directories
    ///
    /// # Errors
    /// `Io` when a directory cannot be created
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config.results_dir, &self.config.uploads_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SegmentationError::file_io_error("create directory", dir, &e))?;
        }
        Ok(())
    }

    /// Public URLs of a job's artifacts
    #[must_use]
    pub fn artifact_refs(&self, job_id: &Uuid) -> ArtifactRefs {
        let prefix = self.config.results_url_prefix.trim_end_matches('/');
        let [mask, overlay, segmentation] = artifact_names(job_id);
        ArtifactRefs {
            result_mask_url: format!("{prefix}/{mask}"),
            overlay_url: format!("{prefix}/{overlay}"),
            segmentation_url: format!("{prefix}/{segmentation}"),
        }
    }

    /// Write all three artifacts and return their URLs
    ///
    /// # Errors
    /// `Io` when a file cannot be written
    pub async fn save_artifacts(
        &self,
        job_id: &Uuid,
        artifacts: &RenderedArtifacts,
    ) -> Result<ArtifactRefs> {
        self.ensure_dirs().await?;
        let [mask, overlay, segmentation] = artifact_names(job_id);
        for (name, bytes) in [
            (mask, &artifacts.binary_mask),
            (overlay, &artifacts.overlay),
            (segmentation, &artifacts.segmentation),
        ] {
            let path = self.config.results_dir.join(&name);
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| SegmentationError::file_io_error("write artifact", &path, &e))?;
            debug!(path = %path.display(), bytes = bytes.len(), "Artifact written");
        }
        Ok(self.artifact_refs(job_id))
    }

    /// Persist the submitted image as `{job_id}_input.{ext}`
    ///
    /// Returns `None` when inputs are not kept.
    ///
    /// # Errors
    /// `Io` when the file cannot be written
    pub async fn save_input(&self, job_id: &Uuid, extension: &str, bytes: &[u8]) -> Result<Option<PathBuf>> {
        if !self.config.keep_inputs {
            return Ok(None);
        }
        self.ensure_dirs().await?;
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        let path = self.config.uploads_dir.join(format!("{job_id}_input.{extension}"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SegmentationError::file_io_error("write input", &path, &e))?;
        Ok(Some(path))
    }

    /// Read an artifact by file name
    ///
    /// # Errors
    /// - `Validation` for names that are not a plain file name
    /// - `NotFound` when the file does not exist
    pub async fn read_artifact(&self, name: &str) -> Result<Vec<u8>> {
        PathValidator::validate_artifact_name(name)?;
        let path = self.config.results_dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SegmentationError::not_found(format!("Result file '{name}' not found")))
            },
            Err(e) => Err(SegmentationError::file_io_error("read artifact", &path, &e)),
        }
    }

    /// Delete every file of a job from both directories
    ///
    /// Returns the number of files removed.
    ///
    /// # Errors
    /// `Io` when a matching file cannot be removed
    pub async fn delete_job_files(&self, job_id: &Uuid) -> Result<usize> {
        let mut removed = 0;
        for dir in [&self.config.results_dir, &self.config.uploads_dir] {
            for path in Self::job_files(dir, job_id) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                    Err(e) => return Err(SegmentationError::file_io_error("delete", &path, &e)),
                }
            }
        }
        debug!(%job_id, removed, "Job files deleted");
        Ok(removed)
    }

    fn job_files(dir: &Path, job_id: &Uuid) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/{job_id}_*",
            glob::Pattern::escape(&dir.to_string_lossy())
        );
        match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(std::result::Result::ok).collect(),
            Err(e) => {
                warn!("Invalid cleanup pattern {pattern}: {e}");
                Vec::new()
            },
        }
    }
}
