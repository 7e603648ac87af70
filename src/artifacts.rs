//! Metrics and visual artifacts derived from a class map
//!
//! Everything here is pure: images are rendered and encoded to PNG byte
//! buffers, and writing them out is left to the storage service.

use crate::error::{Result, SegmentationError};
use crate::types::{ClassMap, ClassMapStatistics};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use std::io::Cursor;

/// Overlay color for vegetation pixels
pub const VEGETATION_COLOR: [u8; 3] = [0, 255, 0];

/// Weight of [`VEGETATION_COLOR`] in the overlay blend
pub const OVERLAY_ALPHA: f32 = 0.3;

/// Colors for the multi-class visualization, indexed by class id
pub const CLASS_PALETTE: [[u8; 3]; 7] = [
    [40, 40, 40],    // background
    [34, 139, 34],   // forest green
    [124, 252, 0],   // lawn green
    [0, 100, 0],     // dark green
    [154, 205, 50],  // yellow green
    [107, 142, 35],  // olive drab
    [189, 183, 107], // dark khaki
];

/// Encoded PNG artifacts for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    /// Grayscale mask, 0 for background and 255 for vegetation
    pub binary_mask: Vec<u8>,
    /// Source image with vegetation tinted green
    pub overlay: Vec<u8>,
    /// Palette-colored class map
    pub segmentation: Vec<u8>,
}

/// Computes metrics and renders the mask, overlay and class visualization
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    background_class: u8,
    alpha: f32,
    palette: Vec<[u8; 3]>,
}

impl ArtifactBuilder {
    #[must_use]
    pub fn new(background_class: u8) -> Self {
        Self {
            background_class,
            alpha: OVERLAY_ALPHA,
            palette: CLASS_PALETTE.to_vec(),
        }
    }

    /// Color for a class id; ids past the palette wrap around
    #[must_use]
    pub fn class_color(&self, label: u8) -> [u8; 3] {
        let len = self.palette.len().max(1);
        self.palette
            .get(usize::from(label) % len)
            .copied()
            .unwrap_or([0, 0, 0])
    }

    #[must_use]
    pub fn metrics(&self, map: &ClassMap) -> ClassMapStatistics {
        map.statistics(self.background_class)
    }

    /// Binary vegetation mask
    #[must_use]
    pub fn binary_mask(&self, map: &ClassMap) -> GrayImage {
        let mask = map.vegetation_mask(self.background_class);
        GrayImage::from_fn(map.width() as u32, map.height() as u32, |x, y| {
            let vegetation = mask
                .get((y as usize, x as usize))
                .copied()
                .unwrap_or(false);
            Luma([if vegetation { 255 } else { 0 }])
        })
    }

    /// Source image with vegetation pixels blended toward green
    ///
    /// # Errors
    /// `Processing` when the image and the map differ in size
    pub fn overlay(&self, source: &RgbImage, map: &ClassMap) -> Result<RgbImage> {
        let (width, height) = source.dimensions();
        if (height as usize, width as usize) != map.dimensions() {
            return Err(SegmentationError::processing_stage_error(
                "overlay",
                &format!(
                    "class map is {:?} but the image is {}x{}",
                    map.dimensions(),
                    height,
                    width
                ),
                None,
            ));
        }

        let mut overlay = source.clone();
        for (x, y, pixel) in overlay.enumerate_pixels_mut() {
            let label = map.get(y as usize, x as usize).unwrap_or(self.background_class);
            if label != self.background_class {
                *pixel = Rgb(blend(pixel.0, VEGETATION_COLOR, self.alpha));
            }
        }
        Ok(overlay)
    }

    /// Palette-colored class map
    #[must_use]
    pub fn class_visualization(&self, map: &ClassMap) -> RgbImage {
        RgbImage::from_fn(map.width() as u32, map.height() as u32, |x, y| {
            let label = map.get(y as usize, x as usize).unwrap_or(self.background_class);
            Rgb(self.class_color(label))
        })
    }

    /// Compute metrics and encode all three artifacts
    ///
    /// # Errors
    /// - Image and map differ in size
    /// - PNG encoding failures
    pub fn build(
        &self,
        source: &RgbImage,
        map: &ClassMap,
    ) -> Result<(ClassMapStatistics, RenderedArtifacts)> {
        let statistics = self.metrics(map);
        let overlay = self.overlay(source, map)?;

        let artifacts = RenderedArtifacts {
            binary_mask: encode_png(&DynamicImage::ImageLuma8(self.binary_mask(map)))?,
            overlay: encode_png(&DynamicImage::ImageRgb8(overlay))?,
            segmentation: encode_png(&DynamicImage::ImageRgb8(self.class_visualization(map)))?,
        };
        Ok((statistics, artifacts))
    }
}

/// `(1 - alpha) * base + alpha * tint`, rounded per channel
fn blend(base: [u8; 3], tint: [u8; 3], alpha: f32) -> [u8; 3] {
    let mix = |b: u8, t: u8| {
        (f32::from(b) * (1.0 - alpha) + f32::from(t) * alpha)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    [
        mix(base[0], tint[0]),
        mix(base[1], tint[1]),
        mix(base[2], tint[2]),
    ]
}

/// Encode an image as PNG
///
/// # Errors
/// Propagates encoder failures
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
