//! Utility modules shared by the pipeline, the job layer and the CLI

pub mod preprocessing;
pub mod validation;

pub use preprocessing::PatchPreprocessor;
pub use validation::{NumericValidator, PathValidator, TensorValidator};
