//! Deterministic models for exercising the pipeline without weights
//!
//! These implement [`SegmentationModel`] with fixed, easily predicted
//! outputs so tiling, reconstruction and the job lifecycle can be verified
//! pixel by pixel.

use crate::{
    config::TensorLayout,
    error::{Result, SegmentationError},
    inference::SegmentationModel,
    models::{ModelInfo, PreprocessingConfig},
};
use ndarray::{Array4, Axis};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metadata for a test model at the given patch size
#[must_use]
pub fn info_for(model: &dyn SegmentationModel, patch_size: u32) -> ModelInfo {
    ModelInfo {
        name: model.name().to_string(),
        backend: crate::config::ModelBackend::Heuristic,
        size_bytes: 0,
        input_size: patch_size,
        num_classes: u8::try_from(model.num_classes()).unwrap_or(u8::MAX),
        layout: model.layout(),
    }
}

/// Spatial size of a batch-of-one input tensor
fn spatial_dims(input: &Array4<f32>, layout: TensorLayout) -> Result<(usize, usize)> {
    let (batch, a, b, c) = input.dim();
    if batch != 1 {
        return Err(SegmentationError::inference(format!(
            "Expected batch size 1, got {batch}"
        )));
    }
    match layout {
        TensorLayout::Nchw if a == 3 => Ok((b, c)),
        TensorLayout::Nhwc if c == 3 => Ok((a, b)),
        _ => Err(SegmentationError::inference(format!(
            "Malformed input shape {:?} for {:?}",
            input.shape(),
            layout
        ))),
    }
}

/// Build a one-hot output tensor from a per-pixel labeling function
fn one_hot<F>(
    height: usize,
    width: usize,
    num_classes: usize,
    layout: TensorLayout,
    label_at: F,
) -> Array4<f32>
where
    F: Fn(usize, usize) -> usize,
{
    match layout {
        TensorLayout::Nchw => Array4::from_shape_fn((1, num_classes, height, width), |(_, c, y, x)| {
            if label_at(y, x) == c {
                1.0
            } else {
                0.0
            }
        }),
        TensorLayout::Nhwc => Array4::from_shape_fn((1, height, width, num_classes), |(_, y, x, c)| {
            if label_at(y, x) == c {
                1.0
            } else {
                0.0
            }
        }),
    }
}

/// Predicts the same class for every pixel
#[derive(Debug, Clone)]
pub struct FixedClassModel {
    num_classes: usize,
    class: usize,
    layout: TensorLayout,
    calls: Arc<AtomicUsize>,
}

impl FixedClassModel {
    #[must_use]
    pub fn new(num_classes: usize, class: usize, layout: TensorLayout) -> Self {
        Self {
            num_classes,
            class,
            layout,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `predict` calls so far
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for FixedClassModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (height, width) = spatial_dims(input, self.layout)?;
        Ok(one_hot(height, width, self.num_classes, self.layout, |_, _| {
            self.class
        }))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn name(&self) -> &str {
        "mock-fixed-class"
    }
}

/// Labels each pixel from the intensity of its red sample
///
/// The red value `r` in `0..=255` maps to class `r * C / 256`, so the
/// expected class map of any image is known in advance.
#[derive(Debug, Clone)]
pub struct IntensityBandModel {
    num_classes: usize,
    layout: TensorLayout,
    preprocessing: PreprocessingConfig,
}

impl IntensityBandModel {
    /// `preprocessing` must match the adapter's so samples can be recovered
    #[must_use]
    pub fn new(num_classes: usize, layout: TensorLayout, preprocessing: PreprocessingConfig) -> Self {
        Self {
            num_classes,
            layout,
            preprocessing,
        }
    }

    /// Class the model assigns to a red sample value
    #[must_use]
    pub fn expected_label(red: u8, num_classes: usize) -> u8 {
        (usize::from(red) * num_classes / 256) as u8
    }

    fn red_sample(&self, normalized: f32) -> u8 {
        let mean = self.preprocessing.normalization_mean[0];
        let std = self.preprocessing.normalization_std[0];
        ((normalized * std + mean) * 255.0).round().clamp(0.0, 255.0) as u8
    }
}

impl SegmentationModel for IntensityBandModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (height, width) = spatial_dims(input, self.layout)?;
        let batch = input.index_axis(Axis(0), 0);
        let red = match self.layout {
            TensorLayout::Nchw => batch.index_axis(Axis(0), 0).to_owned(),
            TensorLayout::Nhwc => batch.index_axis(Axis(2), 0).to_owned(),
        };

        Ok(one_hot(height, width, self.num_classes, self.layout, |y, x| {
            let sample = red.get((y, x)).copied().unwrap_or(0.0);
            usize::from(Self::expected_label(self.red_sample(sample), self.num_classes))
        }))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn name(&self) -> &str {
        "mock-intensity-band"
    }
}

/// Fails every call with an inference error
#[derive(Debug, Clone)]
pub struct FailingModel {
    num_classes: usize,
    message: String,
}

impl FailingModel {
    #[must_use]
    pub fn new(num_classes: usize, message: &str) -> Self {
        Self {
            num_classes,
            message: message.to_string(),
        }
    }
}

impl SegmentationModel for FailingModel {
    fn predict(&self, _input: &Array4<f32>) -> Result<Array4<f32>> {
        Err(SegmentationError::inference(self.message.clone()))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }

    fn name(&self) -> &str {
        "mock-failing"
    }
}

/// Panics inside `predict`
#[derive(Debug, Clone)]
pub struct PanickingModel {
    num_classes: usize,
}

impl PanickingModel {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl SegmentationModel for PanickingModel {
    #[allow(clippy::panic)]
    fn predict(&self, _input: &Array4<f32>) -> Result<Array4<f32>> {
        panic!("mock model panicked");
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }

    fn name(&self) -> &str {
        "mock-panicking"
    }
}

/// Returns a tensor with the wrong number of classes
#[derive(Debug, Clone)]
pub struct MalformedOutputModel {
    num_classes: usize,
}

impl MalformedOutputModel {
    #[must_use]
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

impl SegmentationModel for MalformedOutputModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (height, width) = spatial_dims(input, TensorLayout::Nhwc)?;
        Ok(Array4::zeros((1, height, width, self.num_classes + 1)))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        TensorLayout::Nhwc
    }

    fn name(&self) -> &str {
        "mock-malformed"
    }
}

/// Delays every call before delegating to an inner model
///
/// The delay blocks the calling thread, like real inference does. Calls are
/// counted, along with the most calls ever in flight at once.
#[derive(Clone)]
pub struct SlowModel {
    inner: Arc<dyn SegmentationModel>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowModel {
    #[must_use]
    pub fn new(inner: Arc<dyn SegmentationModel>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently executing
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls that ran concurrently
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for SlowModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let output = self.inner.predict(input);
        self.active.fetch_sub(1, Ordering::SeqCst);
        output
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn layout(&self) -> TensorLayout {
        self.inner.layout()
    }

    fn name(&self) -> &str {
        "mock-slow"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_class_output_shape() {
        let model = FixedClassModel::new(7, 2, TensorLayout::Nchw);
        let output = model.predict(&Array4::zeros((1, 3, 4, 5))).unwrap();
        assert_eq!(output.shape(), &[1, 7, 4, 5]);
        assert_eq!(output[[0, 2, 3, 4]], 1.0);
        assert_eq!(output[[0, 0, 3, 4]], 0.0);
        assert_eq!(model.call_count(), 1);
    }

    #[test]
    fn test_fixed_class_rejects_bad_input() {
        let model = FixedClassModel::new(7, 2, TensorLayout::Nhwc);
        assert!(model.predict(&Array4::zeros((1, 4, 4, 1))).is_err());
        assert!(model.predict(&Array4::zeros((2, 4, 4, 3))).is_err());
    }

    #[test]
    fn test_expected_label_bands() {
        assert_eq!(IntensityBandModel::expected_label(0, 7), 0);
        assert_eq!(IntensityBandModel::expected_label(36, 7), 0);
        assert_eq!(IntensityBandModel::expected_label(37, 7), 1);
        assert_eq!(IntensityBandModel::expected_label(255, 7), 6);
    }

    #[test]
    fn test_intensity_band_recovers_samples() {
        let preprocessing = PreprocessingConfig::default();
        let model = IntensityBandModel::new(7, TensorLayout::Nhwc, preprocessing.clone());
        for red in [0_u8, 37, 128, 254] {
            let normalized = (f32::from(red) / 255.0 - preprocessing.normalization_mean[0])
                / preprocessing.normalization_std[0];
            assert_eq!(model.red_sample(normalized), red);
        }
    }

    #[test]
    fn test_failing_and_malformed_models() {
        let input = Array4::zeros((1, 4, 4, 3));
        assert!(FailingModel::new(7, "boom").predict(&input).is_err());
        let output = MalformedOutputModel::new(7).predict(&input).unwrap();
        assert_eq!(output.shape(), &[1, 4, 4, 8]);
    }
}
