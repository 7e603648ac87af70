//! Numeric validation utilities
//!
//! Range checks for caller-supplied numbers and the rounding rules used by
//! reported metrics.

use crate::error::{Result, SegmentationError};

/// Validator for numeric parameters and derived metrics
pub struct NumericValidator;

impl NumericValidator {
    /// Validate a binarization threshold (inclusive `0.0..=1.0`)
    ///
    /// # Errors
    /// Returns `Validation` for non-finite or out-of-range values
    pub fn validate_threshold(value: f32) -> Result<f32> {
        if !value.is_finite() {
            return Err(SegmentationError::validation(format!(
                "Threshold must be a finite number, got {value}"
            )));
        }

        if !(0.0..=1.0).contains(&value) {
            return Err(SegmentationError::validation(format!(
                "Threshold must be between 0 and 1, got {value}"
            )));
        }

        Ok(value)
    }

    /// Validate numeric range (inclusive)
    ///
    /// # Errors
    /// Returns `InvalidConfig` when `value` is outside `min..=max`
    pub fn validate_range<T>(value: T, min: T, max: T, name: &str) -> Result<T>
    where
        T: PartialOrd + std::fmt::Display + Copy,
    {
        if value < min || value > max {
            return Err(SegmentationError::invalid_config(format!(
                "{name} must be between {min} and {max}, got {value}"
            )));
        }
        Ok(value)
    }

    /// Share of `count` in `total` as a percentage, `0.0` for an empty total
    #[must_use]
    pub fn percentage(count: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (count as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Round to two decimal places
    #[must_use]
    pub fn round2(value: f64) -> f64 {
        (value * 100.0).round() / 100.0
    }

    /// Percentage rounded to two decimals that stays strictly between 0 and
    /// 100 unless `count` is 0 or `total`
    #[must_use]
    pub fn rounded_share(count: u64, total: u64) -> f64 {
        let rounded = Self::round2(Self::percentage(count, total));
        if count == 0 || total == 0 {
            0.0
        } else if count >= total {
            100.0
        } else {
            rounded.clamp(0.01, 99.99)
        }
    }
}
