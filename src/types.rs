//! Core types shared by the segmentation pipeline and the job layer

use crate::utils::NumericValidator;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full-resolution per-pixel class labels
///
/// Indexed `[row, col]`. Produced by the reconstructor and read-only
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMap {
    labels: Array2<u8>,
}

impl ClassMap {
    #[must_use]
    pub fn new(labels: Array2<u8>) -> Self {
        Self { labels }
    }

    /// Uniformly labeled map
    #[must_use]
    pub fn filled(height: usize, width: usize, label: u8) -> Self {
        Self::new(Array2::from_elem((height, width), label))
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.labels.nrows()
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.labels.ncols()
    }

    /// (height, width)
    #[must_use]
    pub fn dimensions(&self) -> (usize, usize) {
        self.labels.dim()
    }

    #[must_use]
    pub fn pixel_count(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn labels(&self) -> &Array2<u8> {
        &self.labels
    }

    #[must_use]
    pub fn into_inner(self) -> Array2<u8> {
        self.labels
    }

    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        self.labels.get((row, col)).copied()
    }

    /// Pixel count per label value
    #[must_use]
    pub fn histogram(&self) -> [u64; 256] {
        let mut counts = [0_u64; 256];
        for &label in &self.labels {
            if let Some(count) = counts.get_mut(usize::from(label)) {
                *count += 1;
            }
        }
        counts
    }

    /// Sorted distinct labels present in the map
    #[must_use]
    pub fn unique_classes(&self) -> Vec<u8> {
        self.histogram()
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(label, _)| label as u8)
            .collect()
    }

    /// `true` where the label differs from `background`
    #[must_use]
    pub fn vegetation_mask(&self, background: u8) -> Array2<bool> {
        self.labels.mapv(|label| label != background)
    }

    /// Coverage metrics for the map
    #[must_use]
    pub fn statistics(&self, background: u8) -> ClassMapStatistics {
        let histogram = self.histogram();
        let total_pixels = self.pixel_count() as u64;
        let background_pixels = histogram
            .get(usize::from(background))
            .copied()
            .unwrap_or(0);
        let vegetation_pixels = total_pixels - background_pixels;

        let class_distribution = histogram
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(label, &count)| {
                (
                    label as u8,
                    NumericValidator::rounded_share(count, total_pixels),
                )
            })
            .collect();

        ClassMapStatistics {
            total_pixels,
            vegetation_pixels,
            vegetation_percentage: NumericValidator::rounded_share(vegetation_pixels, total_pixels),
            unique_classes: self.unique_classes(),
            class_distribution,
        }
    }
}

/// Coverage metrics derived from a [`ClassMap`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMapStatistics {
    pub total_pixels: u64,
    pub vegetation_pixels: u64,
    /// Non-background share in percent, rounded to 2 decimals
    pub vegetation_percentage: f64,
    pub unique_classes: Vec<u8>,
    /// Percentage of pixels per present class, rounded to 2 decimals
    pub class_distribution: BTreeMap<u8, f64>,
}

/// Public references to a job's rendered artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRefs {
    pub result_mask_url: String,
    pub overlay_url: String,
    pub segmentation_url: String,
}

/// Timing breakdown for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Fetching the source image (URL jobs only)
    pub download_ms: u64,
    pub decode_ms: u64,
    pub tiling_ms: u64,
    /// Normalization and model execution across all patches
    pub inference_ms: u64,
    pub reconstruction_ms: u64,
    /// Metrics and PNG rendering
    pub artifacts_ms: u64,
    /// Writing artifacts to storage
    pub persist_ms: u64,
    pub total_ms: u64,
}

impl ProcessingTimings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of the total spent in inference
    #[must_use]
    pub fn inference_ratio(&self) -> f64 {
        if self.total_ms == 0 {
            0.0
        } else {
            self.inference_ms as f64 / self.total_ms as f64
        }
    }

    /// Time not attributed to a measured stage
    #[must_use]
    pub fn other_overhead_ms(&self) -> u64 {
        let measured = self.download_ms
            + self.decode_ms
            + self.tiling_ms
            + self.inference_ms
            + self.reconstruction_ms
            + self.artifacts_ms
            + self.persist_ms;
        self.total_ms.saturating_sub(measured)
    }

    /// One-line summary for logs and the CLI
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "total {}ms (download {}ms, decode {}ms, tiling {}ms, inference {}ms, reconstruction {}ms, artifacts {}ms, persist {}ms, other {}ms; inference share {:.0}%)",
            self.total_ms,
            self.download_ms,
            self.decode_ms,
            self.tiling_ms,
            self.inference_ms,
            self.reconstruction_ms,
            self.artifacts_ms,
            self.persist_ms,
            self.other_overhead_ms(),
            self.inference_ratio() * 100.0
        )
    }
}

/// Outcome of a completed job
///
/// Created once at the end of a successful run and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationResult {
    pub vegetation_percentage: f64,
    /// Wall-clock seconds for the whole run, rounded to 2 decimals
    pub processing_time: f64,
    pub method: String,
    pub result_mask_url: String,
    pub overlay_url: String,
    pub segmentation_url: String,
    /// `[height, width]`
    pub image_dimensions: [usize; 2],
    pub unique_classes: Vec<u8>,
    pub class_distribution: BTreeMap<u8, f64>,
    pub patch_count: usize,
    pub timings: ProcessingTimings,
}

impl SegmentationResult {
    /// Assemble the result from the run's metrics and persisted artifacts
    #[must_use]
    pub fn new(
        statistics: ClassMapStatistics,
        artifacts: ArtifactRefs,
        image_dimensions: (usize, usize),
        patch_count: usize,
        method: String,
        timings: ProcessingTimings,
    ) -> Self {
        Self {
            vegetation_percentage: statistics.vegetation_percentage,
            processing_time: NumericValidator::round2(timings.total_ms as f64 / 1000.0),
            method,
            result_mask_url: artifacts.result_mask_url,
            overlay_url: artifacts.overlay_url,
            segmentation_url: artifacts.segmentation_url,
            image_dimensions: [image_dimensions.0, image_dimensions.1],
            unique_classes: statistics.unique_classes,
            class_distribution: statistics.class_distribution,
            patch_count,
            timings,
        }
    }
}
