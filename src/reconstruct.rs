//! Reassembling patch labels into a full-resolution class map
//!
//! The grid does not overlap, so each source pixel is owned by exactly one
//! patch and the merge rule is a plain copy of that patch's valid region.
//! Padded samples are never written. Any inconsistency between the grid and
//! the supplied outputs is a `Reconstruction` error.

use crate::error::{Result, SegmentationError};
use crate::inference::PatchPrediction;
use crate::tiler::TileGrid;
use crate::types::ClassMap;
use ndarray::{s, Array2};
use tracing::error;

/// Assembles class maps from patch predictions
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconstructor;

impl Reconstructor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Build the class map for `grid` from one prediction per patch
    ///
    /// Predictions may arrive in any order.
    ///
    /// # Errors
    /// `Reconstruction` for a missing, duplicate or unknown patch, a label
    /// array of the wrong size, a valid region outside the image, or any
    /// pixel left uncovered
    pub fn reconstruct(&self, grid: &TileGrid, predictions: &[PatchPrediction]) -> Result<ClassMap> {
        let result = Self::assemble(grid, predictions);
        if let Err(e) = &result {
            error!(
                height = grid.height(),
                width = grid.width(),
                patch_size = grid.patch_size(),
                expected_patches = grid.patch_count(),
                received_patches = predictions.len(),
                error = %e,
                "Class map reconstruction failed"
            );
        }
        result
    }

    fn assemble(grid: &TileGrid, predictions: &[PatchPrediction]) -> Result<ClassMap> {
        let patch_size = grid.patch_size();
        let mut slots: Vec<Option<&PatchPrediction>> = vec![None; grid.patch_count()];

        for prediction in predictions {
            let slot = slots.get_mut(prediction.index).ok_or_else(|| {
                SegmentationError::reconstruction(format!(
                    "Unknown patch index {} (grid has {} patches)",
                    prediction.index,
                    grid.patch_count()
                ))
            })?;
            if slot.is_some() {
                return Err(SegmentationError::reconstruction(format!(
                    "Duplicate output for patch {}",
                    prediction.index
                )));
            }
            if prediction.labels.dim() != (patch_size, patch_size) {
                return Err(SegmentationError::reconstruction(format!(
                    "Patch {} output is {:?}, expected ({patch_size}, {patch_size})",
                    prediction.index,
                    prediction.labels.dim()
                )));
            }
            *slot = Some(prediction);
        }

        let mut labels = Array2::<u8>::zeros((grid.height(), grid.width()));
        let mut covered = Array2::<bool>::from_elem((grid.height(), grid.width()), false);

        for (spec, slot) in grid.specs().iter().zip(&slots) {
            let prediction = slot.ok_or_else(|| {
                SegmentationError::reconstruction(format!("Missing output for patch {}", spec.index))
            })?;

            let valid = spec.valid;
            let fits_patch = valid.row_offset + valid.height <= patch_size
                && valid.col_offset + valid.width <= patch_size;
            let fits_image = spec.origin_row + valid.height <= grid.height()
                && spec.origin_col + valid.width <= grid.width();
            if !fits_patch || !fits_image {
                return Err(SegmentationError::reconstruction(format!(
                    "Patch {} valid region {:?} at ({}, {}) escapes bounds",
                    spec.index, valid, spec.origin_row, spec.origin_col
                )));
            }

            let source = prediction.labels.slice(s![
                valid.row_offset..valid.row_offset + valid.height,
                valid.col_offset..valid.col_offset + valid.width
            ]);
            let rows = spec.origin_row..spec.origin_row + valid.height;
            let cols = spec.origin_col..spec.origin_col + valid.width;

            let mut coverage = covered.slice_mut(s![rows.clone(), cols.clone()]);
            if coverage.iter().any(|&c| c) {
                return Err(SegmentationError::reconstruction(format!(
                    "Patch {} overlaps pixels already written",
                    spec.index
                )));
            }
            coverage.fill(true);
            labels.slice_mut(s![rows, cols]).assign(&source);
        }

        if let Some(((row, col), _)) = covered.indexed_iter().find(|(_, &c)| !c) {
            return Err(SegmentationError::reconstruction(format!(
                "Pixel ({row}, {col}) not covered by any patch"
            )));
        }

        Ok(ClassMap::new(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PadMode;
    use crate::tiler::Tiler;
    use ndarray::{Array2, Array3};

    /// Predictions that label each patch pixel with its image row parity and
    /// padded pixels with 9
    fn predictions_for(grid: &TileGrid) -> Vec<PatchPrediction> {
        let size = grid.patch_size();
        grid.specs()
            .iter()
            .map(|spec| {
                let labels = Array2::from_shape_fn((size, size), |(y, x)| {
                    let v = spec.valid;
                    let inside = y >= v.row_offset
                        && y < v.row_offset + v.height
                        && x >= v.col_offset
                        && x < v.col_offset + v.width;
                    if inside {
                        let row = spec.origin_row + y - v.row_offset;
                        let col = spec.origin_col + x - v.col_offset;
                        ((row * 3 + col) % 7) as u8
                    } else {
                        9
                    }
                });
                PatchPrediction {
                    index: spec.index,
                    labels,
                    probabilities: None,
                }
            })
            .collect()
    }

    #[test]
    fn test_reconstruct_copies_valid_regions_only() {
        let grid = TileGrid::new(11, 6, 4).unwrap();
        let predictions = predictions_for(&grid);
        let map = Reconstructor::new().reconstruct(&grid, &predictions).unwrap();

        assert_eq!(map.dimensions(), (11, 6));
        for ((row, col), &label) in map.labels().indexed_iter() {
            assert_eq!(label, ((row * 3 + col) % 7) as u8);
        }
        assert!(!map.unique_classes().contains(&9));
    }

    #[test]
    fn test_reconstruct_small_image_centered_patch() {
        let grid = TileGrid::new(3, 2, 8).unwrap();
        let predictions = predictions_for(&grid);
        let map = Reconstructor::new().reconstruct(&grid, &predictions).unwrap();
        assert_eq!(map.dimensions(), (3, 2));
        assert_eq!(map.get(2, 1), Some(((2 * 3 + 1) % 7) as u8));
    }

    #[test]
    fn test_order_does_not_matter_and_is_idempotent() {
        let grid = TileGrid::new(9, 9, 4).unwrap();
        let predictions = predictions_for(&grid);
        let mut reversed = predictions.clone();
        reversed.reverse();

        let reconstructor = Reconstructor::new();
        let first = reconstructor.reconstruct(&grid, &predictions).unwrap();
        let second = reconstructor.reconstruct(&grid, &predictions).unwrap();
        let third = reconstructor.reconstruct(&grid, &reversed).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_missing_patch_is_error() {
        let grid = TileGrid::new(8, 8, 4).unwrap();
        let mut predictions = predictions_for(&grid);
        predictions.pop();
        let err = Reconstructor::new().reconstruct(&grid, &predictions).unwrap_err();
        assert!(matches!(err, SegmentationError::Reconstruction(_)));
        assert!(err.to_string().contains("Missing output for patch 3"));
    }

    #[test]
    fn test_duplicate_and_unknown_patches_are_errors() {
        let grid = TileGrid::new(8, 8, 4).unwrap();
        let mut predictions = predictions_for(&grid);
        let duplicate = predictions[0].clone();
        predictions.push(duplicate);
        let err = Reconstructor::new().reconstruct(&grid, &predictions).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));

        let mut predictions = predictions_for(&grid);
        predictions[1].index = 42;
        let err = Reconstructor::new().reconstruct(&grid, &predictions).unwrap_err();
        assert!(err.to_string().contains("Unknown patch index 42"));
    }

    #[test]
    fn test_size_mismatch_is_error() {
        let grid = TileGrid::new(8, 8, 4).unwrap();
        let mut predictions = predictions_for(&grid);
        predictions[2].labels = Array2::zeros((3, 4));
        let err = Reconstructor::new().reconstruct(&grid, &predictions).unwrap_err();
        assert!(err.to_string().contains("expected (4, 4)"));
    }

    #[test]
    fn test_reconstruct_from_tiler_round_trip_identity() {
        // Labels equal to the red sample reproduce the red channel exactly
        let image = Array3::from_shape_fn((13, 10, 3), |(y, x, c)| ((y * 10 + x + c) % 200) as u8);
        let tiler = Tiler::new(4, PadMode::Reflect).unwrap();
        let (grid, patches) = tiler.tile_array(&image.view()).unwrap();
        let predictions: Vec<_> = patches
            .iter()
            .map(|patch| PatchPrediction {
                index: patch.spec.index,
                labels: patch.pixels.index_axis(ndarray::Axis(2), 0).to_owned(),
                probabilities: None,
            })
            .collect();

        let map = Reconstructor::new().reconstruct(&grid, &predictions).unwrap();
        assert_eq!(map.labels(), &image.index_axis(ndarray::Axis(2), 0));
    }
}
