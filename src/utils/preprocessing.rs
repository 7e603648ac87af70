//! Patch preprocessing for model inference
//!
//! Converts a `(P, P, 3)` patch of 8-bit samples into the normalized
//! `f32` tensor layout the model expects.

use crate::{config::TensorLayout, models::PreprocessingConfig};
use ndarray::{Array4, ArrayView3};

/// Shared patch preprocessing utilities
pub struct PatchPreprocessor;

impl PatchPreprocessor {
    /// Normalize a patch into a batch-of-one tensor
    ///
    /// Each sample becomes `(x / 255 - mean[c]) / std[c]`. The output shape is
    /// `[1, 3, H, W]` for NCHW and `[1, H, W, 3]` for NHWC.
    #[must_use]
    #[allow(clippy::indexing_slicing)]
    // Safe: output indices are derived from the patch dimensions
    pub fn patch_to_tensor(
        pixels: &ArrayView3<'_, u8>,
        preprocessing_config: &PreprocessingConfig,
        layout: TensorLayout,
    ) -> Array4<f32> {
        let (height, width, channels) = pixels.dim();
        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;

        let normalize = |value: u8, channel: usize| -> f32 {
            let mean = mean.get(channel).copied().unwrap_or(0.0);
            let std = std.get(channel).copied().unwrap_or(1.0);
            (f32::from(value) / 255.0 - mean) / std
        };

        match layout {
            TensorLayout::Nchw => Array4::from_shape_fn((1, channels, height, width), |(_, c, y, x)| {
                normalize(pixels[[y, x, c]], c)
            }),
            TensorLayout::Nhwc => Array4::from_shape_fn((1, height, width, channels), |(_, y, x, c)| {
                normalize(pixels[[y, x, c]], c)
            }),
        }
    }
}
