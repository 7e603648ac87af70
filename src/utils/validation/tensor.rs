//! Tensor validation utilities
//!
//! Shape and value checks for model outputs and decoded image dimensions.

use crate::config::TensorLayout;
use crate::error::{Result, SegmentationError};
use ndarray::ArrayView4;

/// Validator for tensor operations and shape validation
pub struct TensorValidator;

impl TensorValidator {
    /// Largest accepted image edge in pixels
    pub const MAX_DIMENSION: u32 = 32_768;

    /// Validate a model output tensor against the expected patch geometry
    ///
    /// The expected shape is `[1, classes, size, size]` for NCHW and
    /// `[1, size, size, classes]` for NHWC.
    ///
    /// # Errors
    /// Returns `Inference` on a shape mismatch or non-finite values
    pub fn validate_model_output(
        output: &ArrayView4<'_, f32>,
        layout: TensorLayout,
        patch_size: usize,
        num_classes: usize,
    ) -> Result<()> {
        let expected = match layout {
            TensorLayout::Nchw => [1, num_classes, patch_size, patch_size],
            TensorLayout::Nhwc => [1, patch_size, patch_size, num_classes],
        };

        if output.shape() != expected {
            return Err(SegmentationError::inference(format!(
                "Model output shape mismatch. Expected {:?} ({:?}), got {:?}",
                expected,
                layout,
                output.shape()
            )));
        }

        if let Some(value) = output.iter().find(|v| !v.is_finite()) {
            return Err(SegmentationError::inference(format!(
                "Model output contains non-finite value {value}"
            )));
        }

        Ok(())
    }

    /// Validate decoded image dimensions
    ///
    /// # Errors
    /// Returns `Decode` for zero-area or oversized images
    pub fn validate_image_dimensions(width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(SegmentationError::decode(format!(
                "Image has zero area: {width}x{height}"
            )));
        }

        if width > Self::MAX_DIMENSION || height > Self::MAX_DIMENSION {
            return Err(SegmentationError::decode(format!(
                "Image dimensions too large: {}x{}. Maximum: {}x{}",
                width,
                height,
                Self::MAX_DIMENSION,
                Self::MAX_DIMENSION
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_validate_model_output_layouts() {
        let nchw = Array4::<f32>::zeros((1, 7, 8, 8));
        assert!(
            TensorValidator::validate_model_output(&nchw.view(), TensorLayout::Nchw, 8, 7).is_ok()
        );
        assert!(
            TensorValidator::validate_model_output(&nchw.view(), TensorLayout::Nhwc, 8, 7).is_err()
        );

        let nhwc = Array4::<f32>::zeros((1, 8, 8, 7));
        assert!(
            TensorValidator::validate_model_output(&nhwc.view(), TensorLayout::Nhwc, 8, 7).is_ok()
        );
    }

    #[test]
    fn test_validate_model_output_rejects_wrong_classes() {
        let output = Array4::<f32>::zeros((1, 8, 8, 3));
        let err = TensorValidator::validate_model_output(&output.view(), TensorLayout::Nhwc, 8, 7)
            .unwrap_err();
        assert!(matches!(err, SegmentationError::Inference(_)));
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_validate_model_output_rejects_nan() {
        let mut output = Array4::<f32>::zeros((1, 2, 4, 4));
        output[[0, 1, 2, 3]] = f32::NAN;
        let err = TensorValidator::validate_model_output(&output.view(), TensorLayout::Nchw, 4, 2)
            .unwrap_err();
        assert!(err.to_string().contains("non-finite"));
    }

    #[test]
    fn test_validate_image_dimensions() {
        assert!(TensorValidator::validate_image_dimensions(600, 400).is_ok());
        assert!(TensorValidator::validate_image_dimensions(0, 400).is_err());
        assert!(TensorValidator::validate_image_dimensions(40_000, 10).is_err());
    }
}
