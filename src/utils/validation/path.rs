//! Path and submission validation utilities
//!
//! Provides validation for upload file names, source URLs and artifact names.

use crate::error::{Result, SegmentationError};
use std::path::Path;

/// Validator for file names, extensions and source URLs
pub struct PathValidator;

impl PathValidator {
    /// Lowercase extension of a file name, if any
    #[must_use]
    pub fn extension_of(filename: &str) -> Option<String> {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Validate that a file name carries one of the allowed extensions
    ///
    /// # Errors
    /// Returns `Validation` naming the allowed extensions
    pub fn validate_upload_extension(filename: &str, allowed: &[String]) -> Result<String> {
        let extension = Self::extension_of(filename);
        match extension {
            Some(ext) if allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) => Ok(ext),
            other => Err(SegmentationError::validation(format!(
                "Unsupported file type '{}'. Allowed: {}",
                other.map_or_else(|| "(no extension)".to_string(), |e| format!(".{e}")),
                allowed
                    .iter()
                    .map(|a| format!(".{a}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Validate payload size against a limit
    ///
    /// # Errors
    /// Returns `Validation` for empty or oversize payloads
    pub fn validate_upload_size(size: usize, max_bytes: usize) -> Result<()> {
        if size == 0 {
            return Err(SegmentationError::validation("Uploaded file is empty"));
        }
        if size > max_bytes {
            return Err(SegmentationError::validation(format!(
                "File too large: {} bytes (maximum {} MB)",
                size,
                max_bytes / (1024 * 1024)
            )));
        }
        Ok(())
    }

    /// Validate a source URL (absolute http or https with a host)
    ///
    /// # Errors
    /// Returns `Validation` for empty, relative or non-http URLs
    pub fn validate_source_url(url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SegmentationError::validation("URL is required"));
        }

        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .ok_or_else(|| {
                SegmentationError::validation(format!(
                    "URL must start with http:// or https://, got '{url}'"
                ))
            })?;

        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() {
            return Err(SegmentationError::validation(format!(
                "URL has no host: '{url}'"
            )));
        }
        Ok(())
    }

    /// Validate an artifact file name requested by a client
    ///
    /// Only a single path component made of ASCII alphanumerics, `-`, `_`
    /// and `.` is accepted, so requests cannot escape the results directory.
    ///
    /// # Errors
    /// Returns `Validation` for anything else
    pub fn validate_artifact_name(name: &str) -> Result<()> {
        let well_formed = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !well_formed {
            return Err(SegmentationError::validation(format!(
                "Invalid artifact name '{name}'"
            )));
        }
        Ok(())
    }

    /// Check if a file path has an image extension the decoder understands
    pub fn is_supported_image_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                matches!(
                    ext.to_ascii_lowercase().as_str(),
                    "jpg" | "jpeg" | "png" | "tif" | "tiff" | "webp"
                )
            })
    }
}
