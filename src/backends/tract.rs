//! Tract backend for ONNX segmentation models
//!
//! Runs an exported U-Net (or any model with one image input and one
//! per-class score output) with Tract, a pure Rust inference engine. The
//! optimized plan is immutable, so a single instance serves every worker.

use crate::config::{PipelineConfig, TensorLayout};
use crate::error::{Result, SegmentationError};
use crate::inference::SegmentationModel;
use crate::models::{ModelInfo, ModelManager};
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

// Use instant crate for cross-platform time compatibility
use instant::Instant;

/// ONNX segmentation model executed with Tract
pub struct TractSegmentationModel {
    model: TractModel,
    name: String,
    num_classes: usize,
    layout: TensorLayout,
}

impl std::fmt::Debug for TractSegmentationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TractSegmentationModel")
            .field("name", &self.name)
            .field("num_classes", &self.num_classes)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl TractSegmentationModel {
    /// Load, verify and optimize the configured model
    ///
    /// # Errors
    /// - Model file missing, unreadable or failing checksum verification
    /// - ONNX parsing or optimization failures
    pub fn load(manager: &ModelManager, pipeline: &PipelineConfig) -> Result<(Self, ModelInfo)> {
        let model_load_start = Instant::now();
        let model_data = manager.load_model()?;
        let info = manager.describe(pipeline, model_data.len());

        log::info!("Initializing Tract backend");
        log::info!("Model: {} ({:?}, {} classes)", info.name, info.layout, info.num_classes);

        #[allow(clippy::cast_precision_loss)] // Precision loss acceptable for logging display
        let size_mb = info.size_bytes as f64 / (1024.0 * 1024.0);
        log::info!("Model size: {size_mb:.2} MB");

        let model = Self::from_bytes(
            &model_data,
            info.name.clone(),
            pipeline.patch_size as usize,
            usize::from(pipeline.num_classes),
            manager.config().layout,
        )?;

        log::info!(
            "Tract backend initialized in {}ms",
            model_load_start.elapsed().as_millis()
        );
        Ok((model, info))
    }

    /// Build a runnable model from ONNX bytes with a fixed input shape
    ///
    /// # Errors
    /// ONNX parsing, shape inference or optimization failures
    pub fn from_bytes(
        data: &[u8],
        name: String,
        patch_size: usize,
        num_classes: usize,
        layout: TensorLayout,
    ) -> Result<Self> {
        let input_shape = match layout {
            TensorLayout::Nchw => [1, 3, patch_size, patch_size],
            TensorLayout::Nhwc => [1, patch_size, patch_size, 3],
        };

        log::debug!("Creating Tract model from ONNX data with input {input_shape:?}");

        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(data))
            .map_err(|e| SegmentationError::model(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(0, f32::fact(input_shape).into())
            .map_err(|e| SegmentationError::model(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| SegmentationError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| {
                SegmentationError::model(format!("Failed to create runnable model: {e}"))
            })?;

        Ok(Self {
            model,
            name,
            num_classes,
            layout,
        })
    }
}

impl SegmentationModel for TractSegmentationModel {
    fn predict(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        log::trace!("Running Tract inference on {:?}", input.shape());
        let inference_start = Instant::now();

        // tract may link a different ndarray release; exchange plain slices
        let input_data: Vec<f32> = input.iter().copied().collect();
        let input_tensor = Tensor::from_shape(input.shape(), &input_data).map_err(|e| {
            SegmentationError::inference(format!("Failed to build input tensor: {e}"))
        })?;
        let outputs = self
            .model
            .run(tvec![input_tensor.into()])
            .map_err(|e| SegmentationError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| SegmentationError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_shape = output_tensor.shape().to_vec();
        let [batch, a, b, c] = output_shape[..] else {
            return Err(SegmentationError::inference(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            )));
        };
        let output_data = output_tensor.as_slice::<f32>().map_err(|e| {
            SegmentationError::inference(format!("Failed to convert output tensor: {e}"))
        })?;
        let output = Array4::from_shape_vec((batch, a, b, c), output_data.to_vec()).map_err(|e| {
            SegmentationError::inference(format!("Failed to reshape output tensor: {e}"))
        })?;

        log::trace!(
            "Tract inference completed in {}ms, output {:?}",
            inference_start.elapsed().as_millis(),
            output.shape()
        );

        Ok(output)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn name(&self) -> &str {
        &self.name
    }
}
