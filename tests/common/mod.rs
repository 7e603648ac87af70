//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vegseg::{
    artifacts::encode_png,
    backends::mock,
    config::{ModelBackend, PipelineConfig, ServiceConfig, StorageConfig, TensorLayout},
    download::{FetchedImage, ImageFetcher},
    error::{Result, SegmentationError},
    inference::{ModelHandle, SegmentationModel},
    jobs::{JobId, JobOrchestrator, JobSnapshot},
};

/// Service configuration writing into `root`, with a small patch size
pub fn test_config(root: &Path, patch_size: u32) -> ServiceConfig {
    let mut config = ServiceConfig {
        pipeline: PipelineConfig {
            patch_size,
            inference_parallelism: 2,
            ..PipelineConfig::default()
        },
        storage: StorageConfig {
            results_dir: root.join("results"),
            uploads_dir: root.join("uploads"),
            ..StorageConfig::default()
        },
        ..ServiceConfig::default()
    };
    config.model.backend = ModelBackend::Heuristic;
    config.model.layout = TensorLayout::Nhwc;
    config
}

/// Handle holding `model`, described for `patch_size`
pub fn ready_handle(model: Arc<dyn SegmentationModel>, patch_size: u32) -> ModelHandle {
    let info = mock::info_for(model.as_ref(), patch_size);
    ModelHandle::ready(model, info)
}

/// The intensity-band model for the default preprocessing
pub fn intensity_model() -> Arc<dyn SegmentationModel> {
    Arc::new(mock::IntensityBandModel::new(
        7,
        TensorLayout::Nhwc,
        vegseg::models::PreprocessingConfig::default(),
    ))
}

pub fn image_from_fn<F>(width: u32, height: u32, f: F) -> RgbImage
where
    F: Fn(u32, u32) -> [u8; 3],
{
    ImageBuffer::from_fn(width, height, |x, y| Rgb(f(x, y)))
}

pub fn png_from_image(image: &RgbImage) -> Vec<u8> {
    encode_png(&DynamicImage::ImageRgb8(image.clone())).unwrap()
}

pub fn flat_png(width: u32, height: u32, pixel: [u8; 3]) -> Vec<u8> {
    png_from_image(&image_from_fn(width, height, |_, _| pixel))
}

/// Serves fixed bytes per URL; unknown URLs fail like an unreachable host
#[derive(Default)]
pub struct StaticFetcher {
    images: HashMap<String, Vec<u8>>,
    delay: Option<Duration>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.images.get(url) {
            Some(bytes) => Ok(FetchedImage {
                bytes: bytes.clone(),
                content_type: Some("image/png".to_string()),
                extension: "png".to_string(),
            }),
            None => Err(SegmentationError::fetch(format!("Could not reach {url}"))),
        }
    }
}

pub fn start_with_fetcher(
    config: ServiceConfig,
    model: ModelHandle,
    fetcher: StaticFetcher,
) -> Arc<JobOrchestrator> {
    JobOrchestrator::with_fetcher(config, model, Arc::new(fetcher)).unwrap()
}

/// Poll until the job is terminal, returning every observed snapshot
pub async fn poll_until_terminal(
    orchestrator: &JobOrchestrator,
    id: &JobId,
    timeout: Duration,
) -> Vec<JobSnapshot> {
    let deadline = Instant::now() + timeout;
    let mut observed = Vec::new();
    loop {
        let snapshot = orchestrator.status(id).unwrap();
        let terminal = snapshot.status.is_terminal();
        observed.push(snapshot);
        if terminal {
            return observed;
        }
        assert!(Instant::now() < deadline, "job {id} did not finish within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_terminal(orchestrator: &JobOrchestrator, id: &JobId) -> JobSnapshot {
    poll_until_terminal(orchestrator, id, Duration::from_secs(30))
        .await
        .pop()
        .unwrap()
}
