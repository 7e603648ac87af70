//! Service layer separating I/O and progress reporting from the pipeline

pub mod io;
pub mod progress;
pub mod storage;

pub use io::ImageIOService;
pub use progress::{
    ConsoleProgressReporter, NoOpProgressReporter, ProcessingStage, ProgressReporter,
    ProgressTracker, ProgressUpdate,
};
pub use storage::ArtifactStore;
