//! Robust (outlier resistant) statistics over masked arrays.
//!
//! Masks follow the flag convention: `true` excludes the element. Samples
//! which are NaN are excluded as well, so a fully flagged input and an input
//! of NaNs behave the same way: the statistics come back as NaN rather than
//! as an error, and it is up to the caller to mask whatever depends on them.

use crate::{
    constants::MAD_TO_SIGMA,
    ndarray::{Array, ArrayView, Axis, Dimension, RemoveAxis, Zip},
};

/// The median and median absolute deviation of a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustStats {
    /// Median of the unmasked samples, NaN when there are none.
    pub median: f64,
    /// Median of `|x - median|` over the unmasked samples, NaN when there are none.
    pub mad: f64,
}

impl RobustStats {
    /// Statistics of an empty (or fully masked) sample.
    pub const NAN: Self = Self {
        median: f64::NAN,
        mad: f64::NAN,
    };

    /// The MAD scaled to estimate a Gaussian standard deviation.
    pub fn sigma(&self) -> f64 {
        MAD_TO_SIGMA * self.mad
    }

    /// Whether the spread is zero or undefined, i.e. nothing can be normalised by it.
    pub fn is_degenerate(&self) -> bool {
        let sigma = self.sigma();
        !(self.median.is_finite() && sigma.is_finite() && sigma > 0.0)
    }

    /// The modified Z-score of `value`, or `None` when the statistics are degenerate.
    pub fn zscore(&self, value: f64) -> Option<f64> {
        if self.is_degenerate() {
            return None;
        }
        let z = (value - self.median) / self.sigma();
        z.is_finite().then_some(z)
    }
}

/// Median of `values`, reordering them in the process. An even number of
/// samples gives the mean of the two central samples. Empty input gives NaN.
///
/// `values` must not contain NaN.
pub fn median_in_place(values: &mut [f64]) -> f64 {
    let len = values.len();
    if len == 0 {
        return f64::NAN;
    }
    let mid = len / 2;
    let (lower, &mut upper_mid, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    if len % 2 == 1 {
        upper_mid
    } else {
        // the lower central sample is the largest of the lower partition
        let lower_mid = lower
            .iter()
            .copied()
            .max_by(f64::total_cmp)
            .unwrap_or(upper_mid);
        (lower_mid + upper_mid) / 2.0
    }
}

/// Collect the samples which are neither masked nor NaN.
fn unmasked_samples<D: Dimension>(
    values: &ArrayView<f64, D>,
    mask: Option<&ArrayView<bool, D>>,
) -> Vec<f64> {
    match mask {
        Some(mask) => values
            .iter()
            .zip(mask.iter())
            .filter(|(value, masked)| !**masked && !value.is_nan())
            .map(|(&value, _)| value)
            .collect(),
        None => values.iter().copied().filter(|v| !v.is_nan()).collect(),
    }
}

/// Median of the unmasked elements of `values`. NaN if every element is masked.
///
/// # Examples
///
/// ```rust
/// use vlaflag::{ndarray::array, stats::masked_median};
///
/// let values = array![1.0, 2.0, 100.0, 3.0];
/// let mask = array![false, false, true, false];
/// assert_eq!(masked_median(values.view(), Some(mask.view())), 2.0);
/// ```
pub fn masked_median<D: Dimension>(
    values: ArrayView<f64, D>,
    mask: Option<ArrayView<bool, D>>,
) -> f64 {
    let mut samples = unmasked_samples(&values, mask.as_ref());
    median_in_place(&mut samples)
}

/// Median and median absolute deviation of the unmasked elements of `values`,
/// which may have any dimensionality.
///
/// # Examples
///
/// ```rust
/// use vlaflag::{ndarray::array, stats::robust_stats};
///
/// let values = array![1.0, 2.0, 3.0, 4.0, 100.0];
/// let stats = robust_stats(values.view(), None);
/// assert_eq!(stats.median, 3.0);
/// assert_eq!(stats.mad, 1.0);
/// ```
pub fn robust_stats<D: Dimension>(
    values: ArrayView<f64, D>,
    mask: Option<ArrayView<bool, D>>,
) -> RobustStats {
    let mut samples = unmasked_samples(&values, mask.as_ref());
    if samples.is_empty() {
        return RobustStats::NAN;
    }
    let median = median_in_place(&mut samples);
    for sample in samples.iter_mut() {
        *sample = (*sample - median).abs();
    }
    let mad = median_in_place(&mut samples);
    RobustStats { median, mad }
}

/// Robust statistics of every one-dimensional lane of `values` along `axis`.
///
/// The result has the shape of `values` with `axis` removed. For a
/// `(time, frequency)` array and `Axis(0)` this gives one set of statistics
/// per frequency channel.
pub fn robust_stats_lanes<D: RemoveAxis>(
    values: ArrayView<f64, D>,
    mask: ArrayView<bool, D>,
    axis: Axis,
) -> Array<RobustStats, D::Smaller> {
    Zip::from(values.lanes(axis))
        .and(mask.lanes(axis))
        .map_collect(|value_lane, mask_lane| robust_stats(value_lane, Some(mask_lane)))
}
