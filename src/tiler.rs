//! Splitting images into fixed-size patches
//!
//! The grid is non-overlapping with stride `P`. Along an axis of length
//! `n >= P` there are `ceil(n / P)` patches starting at multiples of `P`; the
//! last one is padded on its trailing side when `n` is not a multiple of `P`.
//! Along an axis with `n < P` there is a single patch, padded symmetrically
//! (`floor((P - n) / 2)` leading samples, the remainder trailing).
//!
//! Padding samples are produced by the configured [`PadMode`]. Every source
//! pixel lies in the valid region of exactly one patch.

use crate::config::{PadMode, PipelineConfig};
use crate::error::{Result, SegmentationError};
use image::RgbImage;
use ndarray::{Array3, ArrayView3};

/// The part of a patch that carries real image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidRegion {
    /// Row offset of the first valid sample inside the patch
    pub row_offset: usize,
    /// Column offset of the first valid sample inside the patch
    pub col_offset: usize,
    pub height: usize,
    pub width: usize,
}

impl ValidRegion {
    #[must_use]
    pub fn area(&self) -> usize {
        self.height * self.width
    }
}

/// Placement of one patch in the source image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSpec {
    /// Position in row-major order
    pub index: usize,
    pub grid_row: usize,
    pub grid_col: usize,
    /// Image row of the first valid pixel
    pub origin_row: usize,
    /// Image column of the first valid pixel
    pub origin_col: usize,
    pub valid: ValidRegion,
}

/// A patch with its owned `(P, P, 3)` sample block
#[derive(Debug, Clone)]
pub struct Patch {
    pub spec: PatchSpec,
    pub pixels: Array3<u8>,
}

/// One axis of the grid: where each segment starts and how it is padded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSegment {
    origin: usize,
    lead: usize,
    valid: usize,
}

fn axis_segments(length: usize, patch_size: usize) -> Vec<AxisSegment> {
    if length < patch_size {
        return vec![AxisSegment {
            origin: 0,
            lead: (patch_size - length) / 2,
            valid: length,
        }];
    }

    (0..length.div_ceil(patch_size))
        .map(|k| {
            let origin = k * patch_size;
            AxisSegment {
                origin,
                lead: 0,
                valid: patch_size.min(length - origin),
            }
        })
        .collect()
}

/// Patch layout for an image, without pixel data
///
/// The reconstructor validates patch outputs against this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    height: usize,
    width: usize,
    patch_size: usize,
    rows: usize,
    cols: usize,
    specs: Vec<PatchSpec>,
}

impl TileGrid {
    /// Compute the grid for an `height x width` image
    ///
    /// # Errors
    /// - `Validation` for a zero-area image
    /// - `InvalidConfig` for a zero patch size
    pub fn new(height: usize, width: usize, patch_size: usize) -> Result<Self> {
        if patch_size == 0 {
            return Err(SegmentationError::config_value_error(
                "patch_size",
                0,
                "1-4096",
                Some(512),
            ));
        }
        if height == 0 || width == 0 {
            return Err(SegmentationError::validation(format!(
                "Image has zero area: {height}x{width}"
            )));
        }

        let row_segments = axis_segments(height, patch_size);
        let col_segments = axis_segments(width, patch_size);
        let mut specs = Vec::with_capacity(row_segments.len() * col_segments.len());

        for (grid_row, row) in row_segments.iter().enumerate() {
            for (grid_col, col) in col_segments.iter().enumerate() {
                specs.push(PatchSpec {
                    index: specs.len(),
                    grid_row,
                    grid_col,
                    origin_row: row.origin,
                    origin_col: col.origin,
                    valid: ValidRegion {
                        row_offset: row.lead,
                        col_offset: col.lead,
                        height: row.valid,
                        width: col.valid,
                    },
                });
            }
        }

        Ok(Self {
            height,
            width,
            patch_size,
            rows: row_segments.len(),
            cols: col_segments.len(),
            specs,
        })
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Grid shape as (rows, cols)
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[must_use]
    pub fn patch_count(&self) -> usize {
        self.specs.len()
    }

    /// Patch placements in row-major order
    #[must_use]
    pub fn specs(&self) -> &[PatchSpec] {
        &self.specs
    }

    #[must_use]
    pub fn spec(&self, index: usize) -> Option<&PatchSpec> {
        self.specs.get(index)
    }
}

/// Splits decoded images into patches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tiler {
    patch_size: usize,
    pad_mode: PadMode,
}

impl Tiler {
    /// Create a tiler
    ///
    /// # Errors
    /// `InvalidConfig` when `patch_size` is zero
    pub fn new(patch_size: usize, pad_mode: PadMode) -> Result<Self> {
        if patch_size == 0 {
            return Err(SegmentationError::config_value_error(
                "patch_size",
                0,
                "1-4096",
                Some(512),
            ));
        }
        Ok(Self {
            patch_size,
            pad_mode,
        })
    }

    /// Create a tiler from the pipeline configuration
    ///
    /// # Errors
    /// `InvalidConfig` when the patch size is zero
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(config.patch_size as usize, config.pad_mode)
    }

    #[must_use]
    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    #[must_use]
    pub fn pad_mode(&self) -> PadMode {
        self.pad_mode
    }

    /// Grid for an image of the given size
    ///
    /// # Errors
    /// `Validation` for a zero-area image
    pub fn grid(&self, height: usize, width: usize) -> Result<TileGrid> {
        TileGrid::new(height, width, self.patch_size)
    }

    /// Split an RGB image into patches
    ///
    /// # Errors
    /// `Validation` for a zero-area image
    pub fn tile_image(&self, image: &RgbImage) -> Result<(TileGrid, Vec<Patch>)> {
        let (width, height) = image.dimensions();
        let view = ArrayView3::from_shape((height as usize, width as usize, 3), image.as_raw())
            .map_err(|e| SegmentationError::internal(format!("RGB buffer layout: {e}")))?;
        self.tile_array(&view)
    }

    /// Split a `(H, W, C)` sample array into patches
    ///
    /// # Errors
    /// - `Validation` for a zero-area image
    /// - `Validation` when `C != 3`
    pub fn tile_array(&self, image: &ArrayView3<'_, u8>) -> Result<(TileGrid, Vec<Patch>)> {
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(SegmentationError::validation(format!(
                "Unsupported channel count {channels}, expected 3 (RGB)"
            )));
        }

        let grid = self.grid(height, width)?;
        let patches = grid
            .specs()
            .iter()
            .map(|spec| Patch {
                spec: *spec,
                pixels: self.extract(image, spec),
            })
            .collect();

        tracing::debug!(
            height,
            width,
            patch_size = self.patch_size,
            patches = grid.patch_count(),
            pad_mode = %self.pad_mode,
            "Tiled image"
        );

        Ok((grid, patches))
    }

    /// Build the `(P, P, 3)` block for one patch
    #[allow(clippy::indexing_slicing)]
    // Safe: source indices are mapped into range by `source_index`
    fn extract(&self, image: &ArrayView3<'_, u8>, spec: &PatchSpec) -> Array3<u8> {
        let (height, width, _) = image.dim();
        let size = self.patch_size;
        let row_base = spec.origin_row as isize - spec.valid.row_offset as isize;
        let col_base = spec.origin_col as isize - spec.valid.col_offset as isize;

        Array3::from_shape_fn((size, size, 3), |(y, x, c)| {
            let row = source_index(row_base + y as isize, height, self.pad_mode);
            let col = source_index(col_base + x as isize, width, self.pad_mode);
            match (row, col) {
                (Some(row), Some(col)) => image[[row, col, c]],
                _ => match self.pad_mode {
                    PadMode::Constant(value) => value,
                    PadMode::Reflect => 0,
                },
            }
        })
    }
}

/// Map a possibly out-of-range coordinate onto the source axis
///
/// In-range coordinates map to themselves. Outside the axis, `Reflect`
/// mirrors about the border samples (`-1 -> 1`, `n -> n - 2`), repeating the
/// reflection as often as needed, and `Constant` yields `None`.
fn source_index(index: isize, length: usize, pad_mode: PadMode) -> Option<usize> {
    if (0..length as isize).contains(&index) {
        return Some(index as usize);
    }
    match pad_mode {
        PadMode::Constant(_) => None,
        PadMode::Reflect => Some(reflect_index(index, length)),
    }
}

fn reflect_index(index: isize, length: usize) -> usize {
    if length <= 1 {
        return 0;
    }
    let period = 2 * (length as isize - 1);
    let folded = index.rem_euclid(period);
    if folded >= length as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn gradient(height: usize, width: usize) -> Array3<u8> {
        Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            ((y * 7 + x * 3 + c) % 251) as u8
        })
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(6, 5), 2);
        // Repeated reflection
        assert_eq!(reflect_index(9, 5), 1);
        assert_eq!(reflect_index(-9, 5), 1);
        assert_eq!(reflect_index(-3, 1), 0);
        assert_eq!(reflect_index(2, 2), 0);
    }

    #[test]
    fn test_grid_exact_multiple() {
        let grid = TileGrid::new(1024, 1024, 512).unwrap();
        assert_eq!(grid.shape(), (2, 2));
        assert_eq!(grid.patch_count(), 4);
        for spec in grid.specs() {
            assert_eq!(spec.valid.area(), 512 * 512);
            assert_eq!(spec.valid.row_offset, 0);
        }
    }

    #[test]
    fn test_grid_trailing_edge_padding() {
        let grid = TileGrid::new(600, 1030, 512).unwrap();
        assert_eq!(grid.shape(), (2, 3));

        let last = grid.specs().last().unwrap();
        assert_eq!(last.index, 5);
        assert_eq!((last.origin_row, last.origin_col), (512, 1024));
        assert_eq!(last.valid.height, 88);
        assert_eq!(last.valid.width, 6);
        assert_eq!((last.valid.row_offset, last.valid.col_offset), (0, 0));
    }

    #[test]
    fn test_grid_small_axis_is_centered() {
        let grid = TileGrid::new(100, 700, 512).unwrap();
        assert_eq!(grid.shape(), (1, 2));
        let first = grid.spec(0).unwrap();
        assert_eq!(first.valid.row_offset, 206);
        assert_eq!(first.valid.height, 100);
        assert_eq!(first.valid.col_offset, 0);
        assert_eq!(first.valid.width, 512);
    }

    #[test]
    fn test_grid_rejects_degenerate_input() {
        assert!(matches!(
            TileGrid::new(0, 10, 512),
            Err(SegmentationError::Validation(_))
        ));
        assert!(matches!(
            TileGrid::new(10, 10, 0),
            Err(SegmentationError::InvalidConfig(_))
        ));
        assert!(Tiler::new(0, PadMode::Reflect).is_err());
    }

    #[test]
    fn test_rejects_non_rgb_arrays() {
        let tiler = Tiler::new(8, PadMode::Reflect).unwrap();
        let rgba = Array3::<u8>::zeros((4, 4, 4));
        let err = tiler.tile_array(&rgba.view()).unwrap_err();
        assert!(err.to_string().contains("channel count"));
    }

    #[test]
    fn test_valid_regions_cover_every_pixel_once() {
        for &(height, width, size) in &[(600, 400, 512), (5, 13, 4), (1, 1, 3), (9, 9, 3)] {
            let grid = TileGrid::new(height, width, size).unwrap();
            let mut coverage = Array2::<u32>::zeros((height, width));
            for spec in grid.specs() {
                for y in 0..spec.valid.height {
                    for x in 0..spec.valid.width {
                        coverage[[spec.origin_row + y, spec.origin_col + x]] += 1;
                    }
                }
            }
            assert!(
                coverage.iter().all(|&c| c == 1),
                "coverage broken for {height}x{width} / {size}"
            );
        }
    }

    #[test]
    fn test_patch_pixels_match_source_in_valid_region() {
        let image = gradient(10, 7);
        let tiler = Tiler::new(4, PadMode::Reflect).unwrap();
        let (grid, patches) = tiler.tile_array(&image.view()).unwrap();
        assert_eq!(patches.len(), grid.patch_count());

        for patch in &patches {
            assert_eq!(patch.pixels.dim(), (4, 4, 3));
            let spec = patch.spec;
            for y in 0..spec.valid.height {
                for x in 0..spec.valid.width {
                    for c in 0..3 {
                        assert_eq!(
                            patch.pixels[[spec.valid.row_offset + y, spec.valid.col_offset + x, c]],
                            image[[spec.origin_row + y, spec.origin_col + x, c]]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_reflect_padding_mirrors_border() {
        let image = gradient(6, 6);
        let tiler = Tiler::new(4, PadMode::Reflect).unwrap();
        let (_, patches) = tiler.tile_array(&image.view()).unwrap();

        // Patch (1,1) covers rows/cols 4..6 and pads rows/cols 6..8
        let patch = &patches[3];
        assert_eq!(patch.pixels[[2, 0, 0]], image[[4, 4, 0]]);
        assert_eq!(patch.pixels[[3, 0, 0]], image[[3, 4, 0]]);
        assert_eq!(patch.pixels[[0, 2, 1]], image[[4, 4, 1]]);
    }

    #[test]
    fn test_constant_padding_and_symmetric_small_image() {
        let image = Array3::<u8>::from_elem((2, 2, 3), 200);
        let tiler = Tiler::new(6, PadMode::Constant(7)).unwrap();
        let (grid, patches) = tiler.tile_array(&image.view()).unwrap();
        assert_eq!(grid.patch_count(), 1);

        let patch = &patches[0];
        assert_eq!(patch.spec.valid.row_offset, 2);
        assert_eq!(patch.spec.valid.col_offset, 2);
        assert_eq!(patch.pixels[[0, 0, 0]], 7);
        assert_eq!(patch.pixels[[2, 2, 0]], 200);
        assert_eq!(patch.pixels[[3, 3, 2]], 200);
        assert_eq!(patch.pixels[[5, 5, 1]], 7);
    }

    #[test]
    fn test_tile_image_from_rgb_buffer() {
        let image = RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8, y as u8, 9]));
        let tiler = Tiler::new(4, PadMode::Reflect).unwrap();
        let (grid, patches) = tiler.tile_image(&image).unwrap();
        assert_eq!(grid.height(), 3);
        assert_eq!(grid.width(), 5);
        assert_eq!(patches.len(), 2);
        // height 3 < 4: lead 0, one trailing pad row
        assert_eq!(patches[1].spec.origin_col, 4);
        assert_eq!(patches[1].pixels[[0, 0, 0]], 4);
        assert_eq!(patches[1].pixels[[1, 0, 1]], 1);
    }
}
