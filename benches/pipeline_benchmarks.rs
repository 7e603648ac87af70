use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{ImageBuffer, Rgb, RgbImage};
use std::sync::Arc;
use tokio::runtime::Runtime;
use vegseg::{
    backends::{mock, ExcessGreenModel},
    config::{ModelBackend, PadMode, PipelineConfig, ServiceConfig, TensorLayout},
    inference::{InferenceAdapter, LoadedModel, SegmentationModel},
    models::PreprocessingConfig,
    processor::SegmentationProcessor,
    reconstruct::Reconstructor,
    services::{NoOpProgressReporter, ProgressTracker},
    tiler::Tiler,
};

const SIZES: [(u32, u32); 3] = [(600, 400), (1024, 1024), (2048, 1536)];

fn field_image(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([((x * 7 + y * 3) % 256) as u8, ((x + y) % 200) as u8 + 40, 60])
    })
}

fn benchmark_tiling(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiling");
    for pad_mode in [PadMode::Reflect, PadMode::Constant(0)] {
        let tiler = Tiler::new(512, pad_mode).unwrap();
        for (width, height) in SIZES {
            let image = field_image(width, height);
            group.throughput(Throughput::Elements(u64::from(width * height)));
            group.bench_with_input(
                BenchmarkId::new(pad_mode.to_string(), format!("{width}x{height}")),
                &image,
                |b, image| b.iter(|| tiler.tile_image(black_box(image)).unwrap()),
            );
        }
    }
    group.finish();
}

fn benchmark_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction");
    let pipeline = PipelineConfig {
        patch_size: 256,
        ..PipelineConfig::default()
    };
    let model: Arc<dyn SegmentationModel> = Arc::new(mock::IntensityBandModel::new(
        7,
        TensorLayout::Nhwc,
        PreprocessingConfig::default(),
    ));
    let adapter = InferenceAdapter::new(model, &pipeline, PreprocessingConfig::default()).unwrap();
    let tiler = Tiler::from_config(&pipeline).unwrap();
    let reconstructor = Reconstructor::new();

    for (width, height) in SIZES {
        let (grid, patches) = tiler.tile_image(&field_image(width, height)).unwrap();
        let predictions: Vec<_> = patches
            .iter()
            .map(|patch| adapter.classify(patch, 0.5).unwrap())
            .collect();
        group.throughput(Throughput::Elements(u64::from(width * height)));
        group.bench_function(format!("{width}x{height}"), |b| {
            b.iter(|| reconstructor.reconstruct(black_box(&grid), black_box(&predictions)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_end_to_end_heuristic(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = ServiceConfig::default();
    config.model.backend = ModelBackend::Heuristic;
    let model = ExcessGreenModel::new(7, TensorLayout::Nhwc, PreprocessingConfig::default()).unwrap();
    let model: Arc<dyn SegmentationModel> = Arc::new(model);
    let info = mock::info_for(model.as_ref(), config.pipeline.patch_size);
    let processor = SegmentationProcessor::new(&LoadedModel { model, info }, &config).unwrap();
    let image = Arc::new(field_image(1024, 1024));

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    group.bench_function("heuristic_1024x1024", |b| {
        b.iter(|| {
            rt.block_on(async {
                let reporter = NoOpProgressReporter;
                let mut tracker = ProgressTracker::new(&reporter);
                processor
                    .segment(Arc::clone(&image), 0.5, &mut tracker)
                    .await
                    .unwrap()
            })
        });
    });
    group.finish();
}

criterion_group!(
    pipeline_benches,
    benchmark_tiling,
    benchmark_reconstruction,
    benchmark_end_to_end_heuristic
);
criterion_main!(pipeline_benches);
