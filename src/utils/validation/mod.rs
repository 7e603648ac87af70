//! Consolidated validation utilities
//!
//! Submission checks (threshold, upload, URL, artifact names) and model
//! output shape checks live here so the HTTP layer, the orchestrator and the
//! CLI reject the same inputs with the same messages.

pub mod numeric;
pub mod path;
pub mod tensor;

pub use numeric::NumericValidator;
pub use path::PathValidator;
pub use tensor::TensorValidator;
