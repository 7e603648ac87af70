//! Vegetation segmentation CLI
//!
//! `serve` runs the polling service, `segment` processes local images in the
//! foreground and `config` prints the effective configuration.

use super::config::CliConfigBuilder;
use crate::{
    backends,
    processor::{SegmentationOutcome, SegmentationProcessor},
    services::{ConsoleProgressReporter, ImageIOService, ProgressTracker},
    tracing_config::{init_cli_tracing, TracingFormat},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Vegetation segmentation for aerial and satellite imagery
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "vegseg")]
pub struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true, env = "VEGSEG_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP polling service
    Serve(ServeArgs),
    /// Segment local images and write mask, overlay and class visualization
    Segment(SegmentArgs),
    /// Print the effective configuration as JSON
    Config(ModelArgs),
}

/// Model and pipeline overrides shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct ModelArgs {
    /// Model backend
    #[arg(long, value_enum)]
    pub backend: Option<CliBackend>,

    /// ONNX model file (tract backend)
    #[arg(short, long, value_name = "PATH")]
    pub model: Option<PathBuf>,

    /// Patch edge length in pixels
    #[arg(long)]
    pub patch_size: Option<u32>,

    /// Concurrent patch inferences (0 = number of CPUs)
    #[arg(long)]
    pub parallelism: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Listen address
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Jobs processed concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Directory for rendered artifacts
    #[arg(long, value_name = "DIR")]
    pub results_dir: Option<PathBuf>,

    /// Directory for retained inputs
    #[arg(long, value_name = "DIR")]
    pub uploads_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SegmentArgs {
    /// Input image files or directories
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<PathBuf>,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Output directory (defaults to each input's directory)
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Minimum non-background probability for a vegetation label
    #[arg(short, long)]
    pub threshold: Option<f32>,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Glob pattern for file names inside directories (e.g., "*.tif")
    #[arg(long)]
    pub pattern: Option<String>,

    /// Print one JSON summary per image instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CliBackend {
    Tract,
    Heuristic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

impl From<CliLogFormat> for TracingFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Console => Self::Console,
            CliLogFormat::Compact => Self::Compact,
            #[cfg(feature = "tracing-json")]
            CliLogFormat::Json => Self::Json,
        }
    }
}

/// Per-image summary printed by `segment`
#[derive(Debug, Serialize)]
struct SegmentSummary {
    input: PathBuf,
    vegetation_percentage: f64,
    image_dimensions: [usize; 2],
    unique_classes: Vec<u8>,
    patch_count: usize,
    method: String,
    processing_time: f64,
    mask: PathBuf,
    overlay: PathBuf,
    segmentation: PathBuf,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose, cli.log_format.into()).context("Failed to initialize tracing")?;

    match &cli.command {
        Command::Serve(args) => serve(&cli, args).await,
        Command::Segment(args) => segment(&cli, args).await,
        Command::Config(args) => {
            let config = CliConfigBuilder::from_cli(cli.config.as_deref(), args)?;
            println!("{}", config.to_json_pretty()?);
            Ok(())
        },
    }
}

#[cfg(feature = "server")]
async fn serve(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = CliConfigBuilder::for_serve(cli.config.as_deref(), args)?;
    info!("Starting vegseg service on {}", config.server.bind_addr);
    crate::api::server::serve(config).await
}

#[cfg(not(feature = "server"))]
async fn serve(_cli: &Cli, _args: &ServeArgs) -> Result<()> {
    anyhow::bail!("This build does not include the HTTP service; rebuild with the 'server' feature")
}

async fn segment(cli: &Cli, args: &SegmentArgs) -> Result<()> {
    let config = CliConfigBuilder::from_cli(cli.config.as_deref(), &args.model)?;
    let threshold = args.threshold.unwrap_or(config.pipeline.default_threshold);

    let files = collect_inputs(&args.inputs, args.recursive, args.pattern.as_deref())?;
    if files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok(());
    }
    if let Some(dir) = &args.output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    }

    let loaded = backends::load_model(&config).context("Failed to load segmentation model")?;
    let processor = SegmentationProcessor::new(&loaded, &config).context("Failed to create processor")?;
    info!("Model: {}, {} file(s) to process", processor.method(), files.len());

    let progress_bar = (files.len() > 1 && !args.json).then(|| {
        let pb = ProgressBar::new(files.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    });

    let reporter = ConsoleProgressReporter::new(cli.verbose > 0);
    let batch_start = Instant::now();
    let mut processed = 0usize;
    let mut failed = 0usize;

    for input in &files {
        if let Some(pb) = &progress_bar {
            pb.set_message(format!("{}", input.display()));
        }

        let mut tracker = ProgressTracker::new(&reporter);
        match segment_file(&processor, input, args.output.as_deref(), threshold, &mut tracker).await {
            Ok(summary) => {
                processed += 1;
                print_summary(&summary, args.json)?;
            },
            Err(e) => {
                failed += 1;
                error!("Failed to process {}: {:#}", input.display(), e);
            },
        }

        if let Some(pb) = &progress_bar {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress_bar {
        pb.finish_with_message("done");
    }

    info!(
        "Processed {} image(s) in {:.2}s ({} failed)",
        processed,
        batch_start.elapsed().as_secs_f64(),
        failed
    );
    if failed > 0 && processed == 0 {
        anyhow::bail!("All {failed} input(s) failed");
    }
    Ok(())
}

async fn segment_file(
    processor: &SegmentationProcessor,
    input: &Path,
    output_dir: Option<&Path>,
    threshold: f32,
    tracker: &mut ProgressTracker<'_>,
) -> Result<SegmentSummary> {
    let image = ImageIOService::load_image(input).await?;
    let outcome = processor.segment(Arc::new(image), threshold, tracker).await?;
    let [mask, overlay, segmentation] = output_paths(input, output_dir);
    write_artifacts(&outcome, [&mask, &overlay, &segmentation]).await?;

    let (height, width) = outcome.dimensions();
    Ok(SegmentSummary {
        input: input.to_path_buf(),
        vegetation_percentage: outcome.statistics.vegetation_percentage,
        image_dimensions: [height, width],
        unique_classes: outcome.statistics.unique_classes,
        patch_count: outcome.patch_count,
        method: outcome.method,
        processing_time: outcome.timings.total_ms as f64 / 1000.0,
        mask,
        overlay,
        segmentation,
    })
}

async fn write_artifacts(outcome: &SegmentationOutcome, paths: [&Path; 3]) -> Result<()> {
    let [mask, overlay, segmentation] = paths;
    for (path, bytes) in [
        (mask, &outcome.artifacts.binary_mask),
        (overlay, &outcome.artifacts.overlay),
        (segmentation, &outcome.artifacts.segmentation),
    ] {
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

fn print_summary(summary: &SegmentSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
    } else {
        println!(
            "{}: {:.2}% vegetation, {}x{} px, {} patches, classes {:?}, {:.2}s -> {}",
            summary.input.display(),
            summary.vegetation_percentage,
            summary.image_dimensions[1],
            summary.image_dimensions[0],
            summary.patch_count,
            summary.unique_classes,
            summary.processing_time,
            summary.mask.display()
        );
    }
    Ok(())
}

/// Expand inputs into a sorted, de-duplicated list of image files
fn collect_inputs(inputs: &[PathBuf], recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in inputs {
        if path.is_file() {
            if ImageIOService::is_supported_format(path) {
                files.push(path.clone());
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            files.extend(find_image_files(path, recursive, pattern)?);
        } else {
            anyhow::bail!("Input path does not exist or is not accessible: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).max_depth(max_depth) {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file()
            && ImageIOService::is_supported_format(path)
            && matches_pattern(path, pattern)
        {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    match pattern {
        Some(pat) => path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| glob::Pattern::new(pat).is_ok_and(|p| p.matches(name))),
        None => true,
    }
}

/// `<stem>_mask.png`, `<stem>_overlay.png` and `<stem>_segmentation.png`
fn output_paths(input: &Path, output_dir: Option<&Path>) -> [PathBuf; 3] {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    ["mask", "overlay", "segmentation"].map(|suffix| dir.join(format!("{stem}_{suffix}.png")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_segment_command() {
        let cli = Cli::try_parse_from([
            "vegseg", "-vv", "segment", "a.tif", "dir", "--recursive", "--threshold", "0.6",
            "--backend", "heuristic",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Segment(args) = cli.command else {
            panic!("expected segment command");
        };
        assert_eq!(args.inputs, vec![PathBuf::from("a.tif"), PathBuf::from("dir")]);
        assert!(args.recursive);
        assert_eq!(args.threshold, Some(0.6));
        assert_eq!(args.model.backend, Some(CliBackend::Heuristic));
    }

    #[test]
    fn test_output_paths() {
        let [mask, overlay, seg] = output_paths(Path::new("/data/field.tif"), None);
        assert_eq!(mask, PathBuf::from("/data/field_mask.png"));
        assert_eq!(overlay, PathBuf::from("/data/field_overlay.png"));
        assert_eq!(seg, PathBuf::from("/data/field_segmentation.png"));

        let [mask, _, _] = output_paths(Path::new("field.jpg"), Some(Path::new("out")));
        assert_eq!(mask, PathBuf::from("out/field_mask.png"));
    }

    #[test]
    fn test_collect_inputs_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(nested.join("c.tif"), b"x").unwrap();

        let flat = collect_inputs(&[dir.path().to_path_buf()], false, None).unwrap();
        assert_eq!(flat, vec![dir.path().join("a.jpg"), dir.path().join("b.png")]);

        let deep = collect_inputs(&[dir.path().to_path_buf()], true, None).unwrap();
        assert_eq!(deep.len(), 3);

        let only_png = collect_inputs(&[dir.path().to_path_buf()], true, Some("*.png")).unwrap();
        assert_eq!(only_png, vec![dir.path().join("b.png")]);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        assert!(collect_inputs(&[PathBuf::from("/nonexistent/input.tif")], false, None).is_err());
    }
}
