//! Modified Z-score transform of visibility amplitudes.
//!
//! For each scan segment independently, every amplitude series along time
//! is normalised as `(amp - median) / (1.4826 * MAD)`. Two variants are
//! produced: one per polarization and baseline, and one on the masked mean
//! over polarizations and baselines.
//!
//! Series whose statistics are degenerate (fully masked, or zero spread)
//! are masked and zeroed rather than allowed to become NaN or infinite.

use std::{fmt::Display, path::Path};

use derive_builder::Builder;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    flag_ranges::{flag_ranges, FlagRanges},
    io::cache::{read_zscore_cache, write_zscore_cache},
    marlu::{c32, hifitime::Epoch},
    ndarray::{Array2, Array4, ArrayView4, ArrayViewMut, Axis, RemoveAxis, Slice, Zip},
    segments::ScanSegmentation,
    stats::robust_stats_lanes,
    util::{percent, progress_bar},
    vis::{DataColumn, VisCube, VisReader},
    VlaFlagError,
};

#[derive(Error, Debug)]
/// Configuration errors which stop a Z-score computation or its flagging.
pub enum ZScoreError {
    #[error("Bad scan segmentation {lengths:?}: {reason}")]
    /// The scan lengths don't partition the time axis.
    BadSegmentation {
        /// The offending scan lengths
        lengths: Vec<usize>,
        /// What was wrong with them
        reason: String,
    },

    #[error("Shape mismatch for {name}: expected {expected}, found {found}")]
    /// Two arrays which must agree on their dimensions don't.
    ShapeMismatch {
        /// The array which was inconsistent
        name: String,
        /// The expected shape or length
        expected: String,
        /// The shape or length found
        found: String,
    },

    #[error("Invalid Z-score threshold {threshold}, must be a positive number")]
    /// The threshold can't be compared against.
    BadThreshold {
        /// The offending threshold
        threshold: f64,
    },
}

/// The modified Z-score of a [`VisCube`], with the metadata needed to map
/// its elements back to channels and times.
#[derive(Debug, Clone, PartialEq)]
pub struct ZScoreCube {
    /// Per polarization and baseline Z-score, `(pol, baseline, time, frequency)`
    pub zscore: Array4<f64>,
    /// `true` where `zscore` is not meaningful
    pub mask: Array4<bool>,
    /// Z-score of the amplitude averaged over polarization and baseline, `(time, frequency)`
    pub zscore_avg: Array2<f64>,
    /// `true` where `zscore_avg` is not meaningful
    pub mask_avg: Array2<bool>,
    /// Centre frequency of each channel [Hz]
    pub freqs_hz: Vec<f64>,
    /// The number of channels in every spectral window
    pub chans_per_spw: usize,
    /// Integration time [s]
    pub integration_time_s: f64,
    /// Centroid of each integration
    pub timestamps: Vec<Epoch>,
    /// Antenna indices of each baseline
    pub ant_pairs: Vec<(usize, usize)>,
    /// The scan segmentation the statistics were computed over
    pub scans: ScanSegmentation,
    /// The data column the amplitudes came from
    pub data_column: DataColumn,
    /// Whether the input flags were used as a mask
    pub masked: bool,
    /// The dataset this was computed from, if it was read from storage
    pub source: Option<String>,
}

impl ZScoreCube {
    /// Flag ranges for every unmasked averaged element with `|z| > threshold`.
    ///
    /// # Errors
    ///
    /// see [`flag_ranges`]
    pub fn flag_ranges(&self, threshold: f64) -> Result<FlagRanges<'_>, ZScoreError> {
        flag_ranges(
            self.zscore_avg.view(),
            self.mask_avg.view(),
            &self.timestamps,
            self.chans_per_spw,
            threshold,
        )
    }
}

/// Amplitudes of complex visibilities, in double precision.
pub fn amplitudes(vis: ArrayView4<c32>) -> Array4<f64> {
    vis.mapv(|v| v.norm() as f64)
}

/// Masked mean over the polarization and baseline axes of a
/// `(pol, baseline, time, frequency)` array.
///
/// Returns the `(time, frequency)` mean and its mask, which is set wherever
/// no unmasked sample contributed. Masked means are zero.
pub fn masked_mean_pol_baseline(
    values: ArrayView4<f64>,
    mask: ArrayView4<bool>,
) -> (Array2<f64>, Array2<bool>) {
    let (_, _, num_times, num_freqs) = values.dim();
    let mut sum = Array2::<f64>::zeros((num_times, num_freqs));
    let mut count = Array2::<usize>::zeros((num_times, num_freqs));
    for (values_pol, mask_pol) in values.outer_iter().zip(mask.outer_iter()) {
        for (values_bl, mask_bl) in values_pol.outer_iter().zip(mask_pol.outer_iter()) {
            Zip::from(&mut sum)
                .and(&mut count)
                .and(&values_bl)
                .and(&mask_bl)
                .for_each(|sum, count, &value, &masked| {
                    if !masked && !value.is_nan() {
                        *sum += value;
                        *count += 1;
                    }
                });
        }
    }
    let mut mean_mask = Array2::<bool>::default((num_times, num_freqs));
    Zip::from(&mut sum)
        .and(&mut mean_mask)
        .and(&count)
        .for_each(|mean, masked, &count| {
            if count == 0 {
                *mean = 0.0;
                *masked = true;
            } else {
                *mean /= count as f64;
            }
        });
    (sum, mean_mask)
}

/// Replace `values` with their modified Z-score, in place, with statistics
/// taken along `time_axis` independently within each segment of `scans`.
///
/// Every series whose segment statistics are degenerate is zeroed and masked,
/// as is any individual element whose Z-score is not finite. Returns the
/// number of degenerate (series, segment) pairs.
///
/// # Errors
///
/// Returns [`ZScoreError::BadSegmentation`] if `scans` doesn't cover the
/// time axis exactly, or [`ZScoreError::ShapeMismatch`] if `values` and
/// `mask` disagree.
pub fn modified_zscore_inplace<D: RemoveAxis>(
    mut values: ArrayViewMut<f64, D>,
    mut mask: ArrayViewMut<bool, D>,
    time_axis: Axis,
    scans: &ScanSegmentation,
) -> Result<usize, ZScoreError> {
    if values.shape() != mask.shape() {
        return Err(ZScoreError::ShapeMismatch {
            name: "mask".into(),
            expected: format!("{:?}", values.shape()),
            found: format!("{:?}", mask.shape()),
        });
    }
    if time_axis.index() >= values.ndim() {
        return Err(ZScoreError::ShapeMismatch {
            name: "time axis".into(),
            expected: format!("< {}", values.ndim()),
            found: time_axis.index().to_string(),
        });
    }
    scans.validate(values.len_of(time_axis))?;

    let mut num_degenerate = 0;
    for range in scans.ranges() {
        let mut seg_values = values.slice_axis_mut(time_axis, Slice::from(range.clone()));
        let mut seg_mask = mask.slice_axis_mut(time_axis, Slice::from(range));
        let seg_stats = robust_stats_lanes(seg_values.view(), seg_mask.view(), time_axis);

        Zip::from(seg_values.lanes_mut(time_axis))
            .and(seg_mask.lanes_mut(time_axis))
            .and(&seg_stats)
            .for_each(|mut value_lane, mut mask_lane, stats| {
                if stats.is_degenerate() {
                    value_lane.fill(0.0);
                    mask_lane.fill(true);
                    num_degenerate += 1;
                    return;
                }
                Zip::from(&mut value_lane)
                    .and(&mut mask_lane)
                    .for_each(|value, masked| match stats.zscore(*value) {
                        Some(z) => *value = z,
                        None => {
                            *value = 0.0;
                            *masked = true;
                        }
                    });
            });
    }
    Ok(num_degenerate)
}

/// Options for computing the modified Z-score of a dataset
#[derive(Builder, Debug, Clone)]
pub struct ZScoreContext {
    /// Which visibilities to read
    #[builder(default)]
    pub data_column: DataColumn,
    /// Whether existing flags are excluded from the statistics
    #[builder(default = "true")]
    pub masked: bool,
    /// Whether to recompute even if a cache file exists
    #[builder(default = "false")]
    pub overwrite: bool,
    /// Scan lengths to use instead of the ones reported by storage
    #[builder(default)]
    pub segmentation: Option<ScanSegmentation>,
    /// Whether to draw progress bars
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl Default for ZScoreContext {
    fn default() -> Self {
        Self {
            data_column: DataColumn::default(),
            masked: true,
            overwrite: false,
            segmentation: None,
            draw_progress: true,
        }
    }
}

impl Display for ZScoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Will use the {} data column.", self.data_column)?;
        writeln!(
            f,
            "{} exclude flagged visibilities from statistics.",
            if self.masked { "Will" } else { "Will not" }
        )?;
        writeln!(
            f,
            "{} overwrite an existing Z-score cache.",
            if self.overwrite { "Will" } else { "Will not" }
        )?;
        match &self.segmentation {
            Some(scans) => writeln!(f, "Will use scan lengths {scans}.")?,
            None => writeln!(f, "Will use scan lengths from the dataset.")?,
        }
        Ok(())
    }
}

impl ZScoreContext {
    /// Compute the modified Z-score of `cube`.
    ///
    /// The scan segmentation is taken from this context if set, else from
    /// the cube, else a single segment covers the whole observation.
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError`] if the cube is inconsistent or the
    /// segmentation doesn't cover its time axis.
    pub fn compute(&self, cube: &VisCube) -> Result<ZScoreCube, ZScoreError> {
        trace!("start ZScoreContext::compute");
        cube.validate()?;
        let num_timesteps = cube.num_timesteps();
        let scans = match self.segmentation.as_ref().or(cube.scans.as_ref()) {
            Some(scans) => scans.clone(),
            None => ScanSegmentation::whole(num_timesteps)?,
        };
        scans.validate(num_timesteps)?;
        debug!(
            "visibility shape {:?}, scans {}, masked={}",
            cube.vis.dim(),
            scans,
            self.masked
        );

        let mut zscore = amplitudes(cube.vis.view());
        let mut mask = if self.masked {
            cube.flags.clone()
        } else {
            Array4::<bool>::default(cube.flags.dim())
        };
        let (mut zscore_avg, mut mask_avg) =
            masked_mean_pol_baseline(zscore.view(), mask.view());

        let num_pols = zscore.len_of(Axis(0));
        let progress = progress_bar(num_pols as u64 + 1, "modified Z-score", self.draw_progress);

        // (baseline, time, frequency) within each polarization
        let mut num_degenerate = 0;
        for (zscore_pol, mask_pol) in zscore.outer_iter_mut().zip(mask.outer_iter_mut()) {
            num_degenerate += modified_zscore_inplace(zscore_pol, mask_pol, Axis(1), &scans)?;
            progress.inc(1);
        }
        let num_degenerate_avg =
            modified_zscore_inplace(zscore_avg.view_mut(), mask_avg.view_mut(), Axis(0), &scans)?;
        progress.inc(1);
        progress.finish();

        if num_degenerate + num_degenerate_avg > 0 {
            warn!(
                "masked {} per-baseline and {} averaged series segments with no usable spread",
                num_degenerate, num_degenerate_avg
            );
        }
        info!(
            "modified Z-score computed over {} scans, {} of averaged samples masked",
            scans.len(),
            percent(mask_avg.iter().filter(|&&m| m).count(), mask_avg.len())
        );

        trace!("end ZScoreContext::compute");
        Ok(ZScoreCube {
            zscore,
            mask,
            zscore_avg,
            mask_avg,
            freqs_hz: cube.freqs_hz.clone(),
            chans_per_spw: cube.chans_per_spw,
            integration_time_s: cube.integration_time_s,
            timestamps: cube.timestamps.clone(),
            ant_pairs: cube.ant_pairs.clone(),
            scans,
            data_column: self.data_column,
            masked: self.masked,
            source: None,
        })
    }

    /// Why `cached` can't stand in for a computation with these options on
    /// `identity`, or `None` if it can.
    fn cache_mismatch(&self, cached: &ZScoreCube, identity: &str) -> Option<String> {
        if cached.data_column != self.data_column {
            return Some(format!(
                "computed from the {} column, not {}",
                cached.data_column, self.data_column
            ));
        }
        if cached.masked != self.masked {
            return Some(format!("computed with masked={}", cached.masked));
        }
        if cached.source.as_deref() != Some(identity) {
            return Some(format!(
                "computed from {}",
                cached.source.as_deref().unwrap_or("an unknown dataset")
            ));
        }
        match &self.segmentation {
            Some(scans) if *scans != cached.scans => {
                Some(format!("computed over scans {}", cached.scans))
            }
            _ => None,
        }
    }

    /// Read `reader`, compute the modified Z-score and write it to `cache_path`,
    /// unless a cache already exists there and `overwrite` is false, in which
    /// case the cached result is returned untouched.
    ///
    /// A cache is only reused if it was computed from the same dataset (by
    /// [`VisReader::identity`]) with the same data column, masking and
    /// segmentation; otherwise it is recomputed and replaced.
    ///
    /// Concurrent runs against the same cache path are not safe.
    ///
    /// # Errors
    ///
    /// Propagates read, compute and cache errors.
    pub fn compute_cached<R: VisReader>(
        &self,
        reader: &R,
        cache_path: &Path,
    ) -> Result<ZScoreCube, VlaFlagError> {
        let identity = reader.identity();
        if cache_path.exists() && !self.overwrite {
            let cached = read_zscore_cache(cache_path)?;
            match self.cache_mismatch(&cached, &identity) {
                None => {
                    info!(
                        "reusing modified Z-score cache {} for {}",
                        cache_path.display(),
                        identity
                    );
                    return Ok(cached);
                }
                Some(reason) => warn!(
                    "recomputing modified Z-score cache {}, it was {}",
                    cache_path.display(),
                    reason
                ),
            }
        }
        info!(
            "reading {} visibilities from {}",
            self.data_column, identity
        );
        let cube = reader.read_vis(self.data_column)?;
        let mut zscore = self.compute(&cube)?;
        zscore.source = Some(identity);
        info!("saving modified Z-score: {}", cache_path.display());
        write_zscore_cache(&zscore, cache_path)?;
        Ok(zscore)
    }
}
