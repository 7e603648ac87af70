//! Vegetation segmentation CLI and HTTP service
//!
//! Thin entry point over [`vegseg::cli`]; `vegseg serve` starts the polling
//! service and `vegseg segment` processes local files.

#[cfg(feature = "cli")]
use vegseg::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(2);
}
