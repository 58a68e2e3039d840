//! Turn exceedances of a baseline-averaged Z-score into time/frequency flag ranges.

use std::{collections::BTreeMap, fmt::Display};

use log::trace;

use crate::{
    constants::DISABLE_THRESHOLD,
    marlu::hifitime::{Duration, Epoch},
    ndarray::ArrayView2,
    zscore::ZScoreError,
};

/// A contiguous region of one channel to be flagged on every baseline and polarization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagRange {
    /// Index into the flattened frequency axis
    pub freq_idx: usize,
    /// Spectral window
    pub spw: usize,
    /// Channel within the spectral window
    pub channel: usize,
    /// The timestep where the exceedance was found
    pub time_idx: usize,
    /// First flagged timestep (inclusive)
    pub start_idx: usize,
    /// Last flagged timestep (inclusive)
    pub end_idx: usize,
    /// Centroid of the first flagged timestep
    pub start: Epoch,
    /// Centroid of the last flagged timestep
    pub end: Epoch,
    /// The Z-score which caused the flag
    pub zscore: f64,
}

/// Format an epoch the way CASA selections expect, `YYYY/MM/DD/hh:mm:ss`.
fn casa_time(epoch: Epoch) -> String {
    let (y, mo, d, h, mi, s, _) = epoch.to_gregorian_utc();
    format!("{y:04}/{mo:02}/{d:02}/{h:02}:{mi:02}:{s:02}")
}

impl FlagRange {
    /// The CASA spectral window selection, `spw:channel`.
    pub fn casa_spw(&self) -> String {
        format!("{}:{}", self.spw, self.channel)
    }

    /// The CASA time range selection, in whole UTC seconds. The start is
    /// rounded down and the end up, so both bounding integrations are covered.
    pub fn casa_timerange(&self) -> String {
        let second = Duration::from_seconds(1.0);
        format!(
            "{}~{}",
            casa_time(self.start.floor(second)),
            casa_time(self.end.ceil(second))
        )
    }
}

impl Display for FlagRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "spw='{}' timerange='{}' (z={:.1})",
            self.casa_spw(),
            self.casa_timerange(),
            self.zscore
        )
    }
}

/// A one-pass, lazily evaluated sequence of [`FlagRange`]s, visiting the
/// Z-score array in (time, frequency) row-major order.
///
/// Overlapping or adjacent ranges are not merged; see [`coalesce_flag_ranges`].
#[derive(Debug, Clone)]
pub struct FlagRanges<'a> {
    zscore: ArrayView2<'a, f64>,
    mask: ArrayView2<'a, bool>,
    timestamps: &'a [Epoch],
    chans_per_spw: usize,
    threshold: f64,
    next_flat_idx: usize,
}

impl<'a> Iterator for FlagRanges<'a> {
    type Item = FlagRange;

    fn next(&mut self) -> Option<Self::Item> {
        let (num_times, num_freqs) = self.zscore.dim();
        let len = num_times * num_freqs;
        while self.next_flat_idx < len {
            let (time_idx, freq_idx) = (
                self.next_flat_idx / num_freqs,
                self.next_flat_idx % num_freqs,
            );
            self.next_flat_idx += 1;
            let zscore = self.zscore[[time_idx, freq_idx]];
            if self.mask[[time_idx, freq_idx]] || zscore.abs() <= self.threshold {
                continue;
            }
            let start_idx = time_idx.saturating_sub(1);
            let end_idx = (time_idx + 1).min(num_times - 1);
            return Some(FlagRange {
                freq_idx,
                spw: freq_idx / self.chans_per_spw,
                channel: freq_idx % self.chans_per_spw,
                time_idx,
                start_idx,
                end_idx,
                start: self.timestamps[start_idx],
                end: self.timestamps[end_idx],
                zscore,
            });
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (num_times, num_freqs) = self.zscore.dim();
        (0, Some(num_times * num_freqs - self.next_flat_idx))
    }
}

/// Find every unmasked element of a `(time, frequency)` Z-score array whose
/// magnitude exceeds `threshold`, and describe a flag range around it: the
/// element's channel, from one integration before to one integration after,
/// clamped to the observation.
///
/// A threshold at or above [`DISABLE_THRESHOLD`] disables flagging, and the
/// sequence is empty whatever the input.
///
/// # Examples
///
/// ```rust
/// use vlaflag::{
///     flag_ranges::flag_ranges,
///     marlu::hifitime::Epoch,
///     ndarray::{array, Array2},
/// };
///
/// let zscore = array![[0.1, 9.0], [0.2, -0.3]];
/// let mask = Array2::<bool>::default((2, 2));
/// let timestamps = [Epoch::from_gpst_seconds(1e9), Epoch::from_gpst_seconds(1e9 + 2.0)];
///
/// let ranges: Vec<_> = flag_ranges(zscore.view(), mask.view(), &timestamps, 2, 5.0)
///     .unwrap()
///     .collect();
/// assert_eq!(ranges.len(), 1);
/// assert_eq!(ranges[0].casa_spw(), "0:1");
/// assert_eq!((ranges[0].start_idx, ranges[0].end_idx), (0, 1));
/// ```
///
/// # Errors
///
/// Returns [`ZScoreError::BadThreshold`] if `threshold` is NaN or not
/// positive, and [`ZScoreError::ShapeMismatch`] if the mask, timestamps or
/// `chans_per_spw` don't fit the Z-score array.
pub fn flag_ranges<'a>(
    zscore: ArrayView2<'a, f64>,
    mask: ArrayView2<'a, bool>,
    timestamps: &'a [Epoch],
    chans_per_spw: usize,
    threshold: f64,
) -> Result<FlagRanges<'a>, ZScoreError> {
    trace!("start flag_ranges");
    if threshold.is_nan() || threshold <= 0.0 {
        return Err(ZScoreError::BadThreshold { threshold });
    }
    let (num_times, num_freqs) = zscore.dim();
    if mask.dim() != zscore.dim() {
        return Err(ZScoreError::ShapeMismatch {
            name: "mask".into(),
            expected: format!("{:?}", zscore.dim()),
            found: format!("{:?}", mask.dim()),
        });
    }
    if timestamps.len() != num_times {
        return Err(ZScoreError::ShapeMismatch {
            name: "timestamps".into(),
            expected: num_times.to_string(),
            found: timestamps.len().to_string(),
        });
    }
    if chans_per_spw == 0 || num_freqs % chans_per_spw != 0 {
        return Err(ZScoreError::ShapeMismatch {
            name: "chans_per_spw".into(),
            expected: format!("a non-zero divisor of {num_freqs}"),
            found: chans_per_spw.to_string(),
        });
    }
    let next_flat_idx = if threshold >= DISABLE_THRESHOLD {
        num_times * num_freqs
    } else {
        0
    };
    Ok(FlagRanges {
        zscore,
        mask,
        timestamps,
        chans_per_spw,
        threshold,
        next_flat_idx,
    })
}

/// Merge ranges on the same channel whose timestep windows overlap or touch.
///
/// The merged range keeps the exceedance with the largest magnitude. The
/// result is ordered by frequency, then time.
pub fn coalesce_flag_ranges<I: IntoIterator<Item = FlagRange>>(ranges: I) -> Vec<FlagRange> {
    let mut by_freq: BTreeMap<usize, Vec<FlagRange>> = BTreeMap::new();
    for range in ranges {
        by_freq.entry(range.freq_idx).or_default().push(range);
    }
    let mut merged = Vec::new();
    for (_, mut chan_ranges) in by_freq {
        chan_ranges.sort_by_key(|range| (range.start_idx, range.end_idx));
        let mut chan_ranges = chan_ranges.into_iter();
        let mut current = match chan_ranges.next() {
            Some(range) => range,
            None => continue,
        };
        for range in chan_ranges {
            if range.start_idx <= current.end_idx + 1 {
                if range.end_idx > current.end_idx {
                    current.end_idx = range.end_idx;
                    current.end = range.end;
                }
                if range.zscore.abs() > current.zscore.abs() {
                    current.zscore = range.zscore;
                    current.time_idx = range.time_idx;
                }
            } else {
                merged.push(current);
                current = range;
            }
        }
        merged.push(current);
    }
    merged
}

/// A summary of flag ranges: the number of ranges in each spectral window.
pub fn summarise_flag_ranges(ranges: &[FlagRange]) -> String {
    let mut per_spw: BTreeMap<usize, usize> = BTreeMap::new();
    for range in ranges {
        *per_spw.entry(range.spw).or_default() += 1;
    }
    per_spw
        .into_iter()
        .map(|(spw, count)| format!("spw {spw:3}: {count} ranges\n"))
        .collect()
}
