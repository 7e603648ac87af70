//! Image I/O operations service
//!
//! Decoding is kept apart from the pipeline so submissions from memory, files
//! and streams all go through the same checks.

use crate::{
    error::{Result, SegmentationError},
    utils::{PathValidator, TensorValidator},
};
use image::{DynamicImage, RgbImage};
use std::path::Path;

/// Service for loading source images
pub struct ImageIOService;

impl ImageIOService {
    /// Decode raw bytes into an RGB pixel array
    ///
    /// Alpha is discarded and grayscale or 16-bit inputs are widened or
    /// narrowed to 8-bit RGB.
    ///
    /// # Errors
    /// `Decode` when the format is not recognized, the data is corrupt, or
    /// the image has zero area
    pub fn load_from_bytes(bytes: &[u8]) -> Result<RgbImage> {
        if bytes.is_empty() {
            return Err(SegmentationError::decode("Image data is empty"));
        }
        let image = image::load_from_memory(bytes).map_err(|e| {
            SegmentationError::decode(format!("Failed to decode image from bytes: {e}"))
        })?;
        Self::into_rgb(image)
    }

    /// Load and decode an image file
    ///
    /// # Errors
    /// - `Io` when the file cannot be read
    /// - `Decode` when its content is not a usable image
    pub async fn load_image<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
        let path_ref = path.as_ref();
        let data = tokio::fs::read(path_ref)
            .await
            .map_err(|e| SegmentationError::file_io_error("read image file", path_ref, &e))?;

        Self::load_from_bytes(&data).map_err(|e| match e {
            SegmentationError::Decode(msg) => {
                SegmentationError::decode(format!("{msg} (path: {})", path_ref.display()))
            },
            other => other,
        })
    }

    /// Read an async stream to the end and decode it
    ///
    /// # Errors
    /// - `Io` when reading fails
    /// - `Decode` when the content is not a usable image
    pub async fn load_from_reader<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Result<RgbImage> {
        use tokio::io::AsyncReadExt;

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        Self::load_from_bytes(&buffer)
    }

    /// Whether the path has a supported image extension
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        PathValidator::is_supported_image_format(path.as_ref())
    }

    fn into_rgb(image: DynamicImage) -> Result<RgbImage> {
        TensorValidator::validate_image_dimensions(image.width(), image.height())?;
        Ok(match image {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        })
    }
}
