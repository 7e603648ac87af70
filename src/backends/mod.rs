//! Model backend implementations
//!
//! - Tract backend (ONNX models, pure Rust)
//! - Excess-green heuristic (no weights required)
//! - Deterministic mock models for tests and benchmarks

pub mod heuristic;
pub mod mock;

#[cfg(feature = "tract")]
pub mod tract;

pub use self::heuristic::ExcessGreenModel;

#[cfg(feature = "tract")]
pub use self::tract::TractSegmentationModel;

use crate::{
    config::{ModelBackend, ServiceConfig},
    error::Result,
    inference::{LoadedModel, SegmentationModel},
    models::ModelManager,
};
use std::sync::Arc;

/// Create the model selected by the configuration
///
/// # Errors
/// - Model file missing, unreadable or failing checksum verification
/// - Backend not compiled into this build
pub fn load_model(config: &ServiceConfig) -> Result<LoadedModel> {
    let manager = ModelManager::new(config.model.clone());

    match config.model.backend {
        ModelBackend::Heuristic => {
            let model = ExcessGreenModel::new(
                usize::from(config.pipeline.num_classes),
                config.model.layout,
                config.model.preprocessing.clone(),
            )?;
            let info = manager.describe(&config.pipeline, 0);
            let model: Arc<dyn SegmentationModel> = Arc::new(model);
            Ok(LoadedModel { model, info })
        },
        #[cfg(feature = "tract")]
        ModelBackend::Tract => {
            let (model, info) = TractSegmentationModel::load(&manager, &config.pipeline)?;
            let model: Arc<dyn SegmentationModel> = Arc::new(model);
            Ok(LoadedModel { model, info })
        },
        #[cfg(not(feature = "tract"))]
        ModelBackend::Tract => Err(crate::error::SegmentationError::model(
            "Tract backend not compiled in; rebuild with the 'tract' feature or use the heuristic backend",
        )),
    }
}

/// Backends available in this build
#[must_use]
pub fn available_backends() -> Vec<ModelBackend> {
    let mut backends = vec![ModelBackend::Heuristic];
    if cfg!(feature = "tract") {
        backends.push(ModelBackend::Tract);
    }
    backends
}
