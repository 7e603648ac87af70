//! Error types for segmentation jobs and the pipeline stages they run

use thiserror::Error;

/// Result type alias for segmentation operations
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Coarse classification of a [`SegmentationError`], used by the HTTP layer
/// to pick a status code and by the job worker to prefix failure messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Fetch,
    Decode,
    Inference,
    Reconstruction,
    ServiceUnavailable,
    Processing,
    NotFound,
    Conflict,
    Config,
    Model,
    Io,
    Internal,
}

/// Comprehensive error types for segmentation operations
#[derive(Error, Debug)]
pub enum SegmentationError {
    /// Malformed submission, rejected before a job is created
    #[error("Validation error: {0}")]
    Validation(String),

    /// Source URL unreachable, timed out, or did not return an image
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Bytes could not be decoded into a pixel array
    #[error("Decode error: {0}")]
    Decode(String),

    /// Model invocation failed or produced malformed output
    #[error("Inference error: {0}")]
    Inference(String),

    /// Patch outputs do not assemble into a consistent class map
    #[error("Reconstruction error: {0}")]
    Reconstruction(String),

    /// Model not loaded or the orchestrator is not accepting work
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Pipeline failure not covered by a more specific stage (e.g. time budget)
    #[error("Processing error: {0}")]
    Processing(String),

    /// Unknown job id or artifact
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the job's current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model loading or initialization errors
    #[error("Model error: {0}")]
    Model(String),

    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SegmentationError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    pub fn reconstruction<S: Into<String>>(msg: S) -> Self {
        Self::Reconstruction(msg.into())
    }

    pub fn service_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {} '{}': {}", operation, path_display, error),
        ))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {}", rec),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {}: {} (valid range: {}).{}",
            parameter, value, valid_range, recommendation
        ))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {})", info),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{}'{}: {}",
            stage, input_context, details
        ))
    }

    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Reconstruction(_) => ErrorKind::Reconstruction,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Processing(_) => ErrorKind::Processing,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::Model(_) => ErrorKind::Model,
            Self::Io(_) | Self::Image(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller is at fault (bad input, unknown id, wrong state)
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict
        )
    }

    /// Message recorded on a failed job.
    ///
    /// Internal invariant violations are reported generically; their details
    /// go to the log instead of the polling client.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Reconstruction(_) | Self::Internal(_) => {
                "Processing error: internal failure while assembling the segmentation".to_string()
            },
            Self::Io(_) => "Processing error: failed to read or write job files".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_error_creation() {
        let err = SegmentationError::validation("threshold out of range");
        assert!(matches!(err, SegmentationError::Validation(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = SegmentationError::fetch("connection refused");
        assert_eq!(err.kind(), ErrorKind::Fetch);
    }

    #[test]
    fn test_error_display() {
        let err = SegmentationError::fetch("connection refused");
        assert_eq!(err.to_string(), "Fetch failed: connection refused");

        let err = SegmentationError::service_unavailable("Model not loaded");
        assert_eq!(err.to_string(), "Service unavailable: Model not loaded");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(SegmentationError::validation("x").is_client_error());
        assert!(SegmentationError::not_found("x").is_client_error());
        assert!(SegmentationError::conflict("x").is_client_error());
        assert!(!SegmentationError::inference("x").is_client_error());
        assert!(!SegmentationError::service_unavailable("x").is_client_error());
    }

    #[test]
    fn test_user_message_hides_internal_details() {
        let err = SegmentationError::reconstruction("patch 3 missing from grid 4x4");
        let message = err.user_message();
        assert!(!message.contains("patch 3"));
        assert!(!message.is_empty());

        let err = SegmentationError::fetch("timed out after 30s");
        assert_eq!(err.user_message(), "Fetch failed: timed out after 30s");
    }

    #[test]
    fn test_enhanced_error_context() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = SegmentationError::file_io_error(
            "write artifact",
            Path::new("/results/a_result.png"),
            &io_error,
        );
        let error_string = err.to_string();
        assert!(error_string.contains("write artifact"));
        assert!(error_string.contains("/results/a_result.png"));

        let err = SegmentationError::config_value_error("workers", 0, "1-64", Some(2));
        let error_string = err.to_string();
        assert!(error_string.contains("workers"));
        assert!(error_string.contains("1-64"));
        assert!(error_string.contains("Recommended: 2"));

        let err =
            SegmentationError::processing_stage_error("tiling", "zero area", Some("0x0 RGB"));
        let error_string = err.to_string();
        assert!(error_string.contains("tiling"));
        assert!(error_string.contains("0x0 RGB"));
    }
}
