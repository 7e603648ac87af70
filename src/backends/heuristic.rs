//! Weights-free vegetation classifier based on the excess-green index
//!
//! `ExG = 2g - r - b` on chromatic coordinates (`r = R / (R + G + B)` and so
//! on) separates green canopy from soil, water and built surfaces well enough
//! for a service that has no trained weights installed. The vegetation
//! probability is a logistic function of ExG; the vegetation subtype is
//! chosen from the green sample's brightness band so all classes are used.

use crate::{
    config::TensorLayout,
    error::{Result, SegmentationError},
    inference::SegmentationModel,
    models::PreprocessingConfig,
};
use ndarray::{Array4, Axis};

/// Excess-green classifier
#[derive(Debug, Clone)]
pub struct ExcessGreenModel {
    num_classes: usize,
    layout: TensorLayout,
    preprocessing: PreprocessingConfig,
    /// ExG value at which vegetation probability is 0.5
    midpoint: f32,
    /// Logistic slope
    steepness: f32,
}

impl ExcessGreenModel {
    /// `preprocessing` must match the adapter's so samples can be recovered
    ///
    /// # Errors
    /// `Model` when fewer than two classes are requested
    pub fn new(
        num_classes: usize,
        layout: TensorLayout,
        preprocessing: PreprocessingConfig,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(SegmentationError::model(format!(
                "Excess-green model needs at least 2 classes, got {num_classes}"
            )));
        }
        Ok(Self {
            num_classes,
            layout,
            preprocessing,
            midpoint: 0.05,
            steepness: 40.0,
        })
    }

    /// Vegetation probability for an RGB sample
    #[must_use]
    pub fn vegetation_probability(&self, rgb: [f32; 3]) -> f32 {
        let [r, g, b] = rgb;
        let sum = r + g + b;
        if sum <= f32::EPSILON {
            return 1.0 / (1.0 + (self.steepness * self.midpoint).exp());
        }
        let exg = (2.0 * g - r - b) / sum;
        1.0 / (1.0 + (-self.steepness * (exg - self.midpoint)).exp())
    }

    /// Vegetation subtype (1-based) for a green sample in `0..=1`
    fn subtype(&self, green: f32) -> usize {
        let subtypes = self.num_classes - 1;
        1 + ((green.clamp(0.0, 1.0) * subtypes as f32) as usize).min(subtypes - 1)
    }

    fn denormalize(&self, value: f32, channel: usize) -> f32 {
        let mean = self.preprocessing.normalization_mean.get(channel).copied().unwrap_or(0.0);
        let std = self.preprocessing.normalization_std.get(channel).copied().unwrap_or(1.0);
        value * std + mean
    }
}

impl SegmentationModel for ExcessGreenModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let malformed = || {
            SegmentationError::inference(format!(
                "Malformed input shape {:?} for {:?}",
                input.shape(),
                self.layout
            ))
        };
        if input.dim().0 != 1 {
            return Err(malformed());
        }

        let batch = input.index_axis(Axis(0), 0);
        let pixels = match self.layout {
            TensorLayout::Nchw => batch.permuted_axes([1, 2, 0]),
            TensorLayout::Nhwc => batch,
        };
        let (height, width, channels) = pixels.dim();
        if channels != 3 {
            return Err(malformed());
        }

        let mut output = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, self.num_classes, height, width)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, height, width, self.num_classes)),
        };

        for y in 0..height {
            for x in 0..width {
                let sample = |c: usize| {
                    self.denormalize(pixels.get((y, x, c)).copied().unwrap_or(0.0), c)
                };
                let rgb = [sample(0), sample(1), sample(2)];
                let vegetation = self.vegetation_probability(rgb);
                let subtype = self.subtype(rgb[1]);

                let (background_idx, subtype_idx) = match self.layout {
                    TensorLayout::Nchw => ([0, 0, y, x], [0, subtype, y, x]),
                    TensorLayout::Nhwc => ([0, y, x, 0], [0, y, x, subtype]),
                };
                if let Some(slot) = output.get_mut(background_idx) {
                    *slot = 1.0 - vegetation;
                }
                if let Some(slot) = output.get_mut(subtype_idx) {
                    *slot = vegetation;
                }
            }
        }

        Ok(output)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn name(&self) -> &str {
        "excess-green"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::PatchPreprocessor;
    use ndarray::Array3;

    fn model() -> ExcessGreenModel {
        ExcessGreenModel::new(7, TensorLayout::Nhwc, PreprocessingConfig::default()).unwrap()
    }

    #[test]
    fn test_vegetation_probability() {
        let model = model();
        assert!(model.vegetation_probability([0.2, 0.6, 0.2]) > 0.99);
        assert!(model.vegetation_probability([0.5, 0.5, 0.5]) < 0.2);
        assert!(model.vegetation_probability([0.6, 0.3, 0.2]) < 0.01);
        assert!(model.vegetation_probability([0.0, 0.0, 0.0]) < 0.2);
    }

    #[test]
    fn test_subtype_range() {
        let model = model();
        assert_eq!(model.subtype(0.0), 1);
        assert_eq!(model.subtype(1.0), 6);
        assert_eq!(model.subtype(0.5), 4);
    }

    #[test]
    fn test_predict_green_and_gray_patches() {
        let model = model();
        let preprocessing = PreprocessingConfig::default();

        let green = Array3::from_shape_fn((4, 4, 3), |(_, _, c)| if c == 1 { 180_u8 } else { 40 });
        let tensor = PatchPreprocessor::patch_to_tensor(&green.view(), &preprocessing, TensorLayout::Nhwc);
        let output = model.predict(&tensor).unwrap();
        assert_eq!(output.shape(), &[1, 4, 4, 7]);
        assert!(output[[0, 1, 1, 0]] < 0.01);

        let gray = Array3::<u8>::from_elem((4, 4, 3), 128);
        let tensor = PatchPreprocessor::patch_to_tensor(&gray.view(), &preprocessing, TensorLayout::Nhwc);
        let output = model.predict(&tensor).unwrap();
        assert!(output[[0, 2, 2, 0]] > 0.8);
    }

    #[test]
    fn test_rejects_single_class() {
        assert!(ExcessGreenModel::new(1, TensorLayout::Nhwc, PreprocessingConfig::default()).is_err());
    }
}
