//! Segmentation model abstraction and the per-patch inference adapter

use crate::{
    config::{PipelineConfig, TensorLayout},
    error::{Result, SegmentationError},
    models::{ModelInfo, PreprocessingConfig},
    tiler::Patch,
    utils::{PatchPreprocessor, TensorValidator},
};
use ndarray::{Array2, Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use std::sync::{Arc, RwLock};

/// A trained segmentation model
///
/// Implementations are shared read-only across workers, so inference takes
/// `&self` and must not keep per-call mutable state.
pub trait SegmentationModel: Send + Sync {
    /// Run the model on a normalized batch-of-one tensor
    ///
    /// The input is `[1, 3, P, P]` (NCHW) or `[1, P, P, 3]` (NHWC) according
    /// to [`SegmentationModel::layout`]; the output holds per-class scores in
    /// the same layout with `num_classes` channels.
    ///
    /// # Errors
    /// - Model execution failures
    /// - Tensor conversion errors
    fn predict(&self, input: &ndarray::Array4<f32>) -> Result<ndarray::Array4<f32>>;

    /// Number of classes in the output
    fn num_classes(&self) -> usize;

    /// Tensor layout of input and output
    fn layout(&self) -> TensorLayout;

    /// Short model identifier for logs and results
    fn name(&self) -> &str;
}

/// Labels (and optionally probabilities) for one patch
#[derive(Debug, Clone)]
pub struct PatchPrediction {
    /// Row-major patch index from the tile grid
    pub index: usize,
    /// `(P, P)` class labels
    pub labels: Array2<u8>,
    /// `(P, P, C)` class probabilities when requested
    pub probabilities: Option<Array3<f32>>,
}

/// Wraps a [`SegmentationModel`] with preprocessing and the labeling rule
///
/// A pixel gets its most probable non-background class when the
/// non-background probability mass reaches the job threshold, and the
/// background class otherwise.
#[derive(Clone)]
pub struct InferenceAdapter {
    model: Arc<dyn SegmentationModel>,
    preprocessing: PreprocessingConfig,
    patch_size: usize,
    background_class: usize,
    softmax: bool,
    keep_probabilities: bool,
}

impl InferenceAdapter {
    /// Create an adapter for the given pipeline geometry
    ///
    /// # Errors
    /// `Model` when the model's class count differs from the pipeline's
    pub fn new(
        model: Arc<dyn SegmentationModel>,
        pipeline: &PipelineConfig,
        preprocessing: PreprocessingConfig,
    ) -> Result<Self> {
        if model.num_classes() != usize::from(pipeline.num_classes) {
            return Err(SegmentationError::model(format!(
                "Model '{}' predicts {} classes but the pipeline expects {}",
                model.name(),
                model.num_classes(),
                pipeline.num_classes
            )));
        }

        Ok(Self {
            model,
            preprocessing,
            patch_size: pipeline.patch_size as usize,
            background_class: usize::from(pipeline.background_class),
            softmax: false,
            keep_probabilities: false,
        })
    }

    /// Treat model outputs as logits
    #[must_use]
    pub fn with_softmax(mut self, softmax: bool) -> Self {
        self.softmax = softmax;
        self
    }

    /// Return the probability volume along with the labels
    #[must_use]
    pub fn with_probabilities(mut self, keep: bool) -> Self {
        self.keep_probabilities = keep;
        self
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    /// Classify every pixel of a patch
    ///
    /// The patch is not modified.
    ///
    /// # Errors
    /// `Inference` for a malformed patch, a model failure or a malformed output
    pub fn classify(&self, patch: &Patch, threshold: f32) -> Result<PatchPrediction> {
        let expected = (self.patch_size, self.patch_size, 3);
        if patch.pixels.dim() != expected {
            return Err(SegmentationError::inference(format!(
                "Patch {} has shape {:?}, expected {:?}",
                patch.spec.index,
                patch.pixels.dim(),
                expected
            )));
        }

        let layout = self.model.layout();
        let input = PatchPreprocessor::patch_to_tensor(&patch.pixels.view(), &self.preprocessing, layout);

        let output = self.model.predict(&input).map_err(|e| {
            if matches!(e, SegmentationError::Inference(_)) {
                e
            } else {
                SegmentationError::inference(e.to_string())
            }
        })?;
        TensorValidator::validate_model_output(
            &output.view(),
            layout,
            self.patch_size,
            self.model.num_classes(),
        )?;

        let scores = match layout {
            TensorLayout::Nchw => output.index_axis(Axis(0), 0).permuted_axes([1, 2, 0]),
            TensorLayout::Nhwc => output.index_axis(Axis(0), 0),
        };

        let mut probabilities = scores.to_owned();
        if self.softmax {
            for mut lane in probabilities.lanes_mut(Axis(2)) {
                softmax_in_place(&mut lane);
            }
        }

        let mut labels = Array2::<u8>::zeros((self.patch_size, self.patch_size));
        Zip::from(&mut labels)
            .and(probabilities.lanes(Axis(2)))
            .for_each(|label, lane| {
                *label = label_pixel(lane, self.background_class, threshold);
            });

        Ok(PatchPrediction {
            index: patch.spec.index,
            labels,
            probabilities: self.keep_probabilities.then_some(probabilities),
        })
    }
}

/// Apply the threshold rule to one pixel's class probabilities
///
/// Ties between non-background classes go to the lower class id.
#[must_use]
pub fn label_pixel(probabilities: ArrayView1<'_, f32>, background: usize, threshold: f32) -> u8 {
    let total: f32 = probabilities.sum();
    let background_p = probabilities.get(background).copied().unwrap_or(0.0);

    let best = probabilities
        .iter()
        .enumerate()
        .filter(|(class, _)| *class != background)
        .fold(None, |best: Option<(usize, f32)>, (class, &p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((class, p)),
        });

    let vegetation_mass = if total > 0.0 {
        (total - background_p) / total
    } else {
        0.0
    };

    match best {
        Some((class, _)) if vegetation_mass > 0.0 && vegetation_mass >= threshold => class as u8,
        _ => background as u8,
    }
}

fn softmax_in_place(lane: &mut ArrayViewMut1<'_, f32>) {
    let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    lane.mapv_inplace(|v| (v - max).exp());
    let sum: f32 = lane.sum();
    if sum > 0.0 {
        lane.mapv_inplace(|v| v / sum);
    }
}

/// A model together with its metadata
#[derive(Clone)]
pub struct LoadedModel {
    pub model: Arc<dyn SegmentationModel>,
    pub info: ModelInfo,
}

/// Shared readiness slot for the service's model
///
/// Submissions and the health probe consult the handle; a missing model
/// surfaces as `ServiceUnavailable`.
#[derive(Clone, Default)]
pub struct ModelHandle {
    slot: Arc<RwLock<Option<LoadedModel>>>,
}

impl ModelHandle {
    /// Handle with no model installed
    #[must_use]
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// Handle with a model ready for inference
    #[must_use]
    pub fn ready(model: Arc<dyn SegmentationModel>, info: ModelInfo) -> Self {
        let handle = Self::default();
        handle.install(model, info);
        handle
    }

    /// Install (or replace) the model
    pub fn install(&self, model: Arc<dyn SegmentationModel>, info: ModelInfo) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(LoadedModel { model, info });
    }

    /// Remove the model; later submissions are rejected
    pub fn unload(&self) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }

    fn current(&self) -> Option<LoadedModel> {
        match self.slot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    /// The installed model
    ///
    /// # Errors
    /// `ServiceUnavailable` when no model is installed
    pub fn get(&self) -> Result<LoadedModel> {
        self.current()
            .ok_or_else(|| SegmentationError::service_unavailable("Model not loaded"))
    }

    #[must_use]
    pub fn info(&self) -> Option<ModelInfo> {
        self.current().map(|loaded| loaded.info)
    }
}
