//! Clip amplitude outliers by their distance from the median, in units of
//! the median absolute deviation.

use std::ops::Range;

use log::{debug, info, trace, warn};

use crate::{
    ndarray::{s, Axis, Zip},
    stats::{robust_stats, RobustStats},
    util::percent,
    vis::VisCube,
    zscore::{amplitudes, ZScoreError},
};

/// The statistics of one clipping window and what they flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipWindow {
    /// Field index, or `None` if the cube has no field ids
    pub field: Option<usize>,
    /// Polarization index
    pub pol: usize,
    /// Spectral window, or `None` if all spectral windows were clipped together
    pub spw: Option<usize>,
    /// Median and (unscaled) MAD of the unflagged amplitudes
    pub stats: RobustStats,
    /// Samples flagged by this window which weren't flagged before
    pub newly_flagged: usize,
}

/// The result of [`mad_clip`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClipStats {
    /// One entry per (field, polarization, spectral window)
    pub windows: Vec<ClipWindow>,
}

impl ClipStats {
    /// The total number of newly flagged samples.
    pub fn newly_flagged(&self) -> usize {
        self.windows.iter().map(|window| window.newly_flagged).sum()
    }
}

/// Flag every unflagged sample of `cube` whose amplitude lies outside
/// `median ± nsig × MAD`.
///
/// Statistics are taken over all baselines and the timesteps of one field,
/// separately for each field, polarization, and (if `per_spw`) spectral
/// window, so a bright calibrator never sets the limits of a faint target.
/// If `fields` is given, only those fields are clipped. The MAD is not scaled
/// to a standard deviation. Windows with no usable spread flag nothing.
///
/// # Errors
///
/// Returns [`ZScoreError::BadThreshold`] if `nsig` isn't a positive number.
pub fn mad_clip(
    cube: &mut VisCube,
    nsig: f64,
    per_spw: bool,
    fields: Option<&[usize]>,
) -> Result<ClipStats, ZScoreError> {
    trace!("start mad_clip");
    if !(nsig.is_finite() && nsig > 0.0) {
        return Err(ZScoreError::BadThreshold { threshold: nsig });
    }
    cube.validate()?;
    let amps = amplitudes(cube.vis.view());
    let freq_windows: Vec<(Option<usize>, Range<usize>)> = if per_spw {
        (0..cube.num_spws())
            .map(|spw| {
                let start = spw * cube.chans_per_spw;
                (Some(spw), start..start + cube.chans_per_spw)
            })
            .collect()
    } else {
        vec![(None, 0..cube.num_freqs())]
    };
    let field_times: Vec<(Option<usize>, Vec<usize>)> = cube
        .timesteps_by_field()
        .into_iter()
        .filter(|(field, _)| match (fields, field) {
            (Some(fields), Some(field)) => fields.contains(field),
            _ => true,
        })
        .collect();
    if field_times.is_empty() {
        warn!("none of the fields {fields:?} were observed, nothing clipped");
    }

    let mut clip_stats = ClipStats::default();
    for (field, times) in &field_times {
        for (pol, (amps_pol, mut flags_pol)) in amps
            .outer_iter()
            .zip(cube.flags.axis_iter_mut(Axis(0)))
            .enumerate()
        {
            for (spw, freqs) in freq_windows.iter().cloned() {
                let amps_window = amps_pol
                    .slice(s![.., .., freqs.clone()])
                    .select(Axis(1), times);
                let mut flags_window = flags_pol
                    .slice(s![.., .., freqs.clone()])
                    .select(Axis(1), times);
                let stats = robust_stats(amps_window.view(), Some(flags_window.view()));
                let mut newly_flagged = 0;
                if stats.is_degenerate() {
                    debug!("field {field:?} pol {pol} spw {spw:?}: no usable spread, nothing clipped");
                } else {
                    let (low, high) = (
                        stats.median - nsig * stats.mad,
                        stats.median + nsig * stats.mad,
                    );
                    Zip::from(&mut flags_window)
                        .and(&amps_window)
                        .for_each(|flag, &amp| {
                            if !*flag && !(low..=high).contains(&amp) {
                                *flag = true;
                                newly_flagged += 1;
                            }
                        });
                    for (&t, flags_t) in times.iter().zip(flags_window.axis_iter(Axis(1))) {
                        flags_pol
                            .slice_mut(s![.., t, freqs.clone()])
                            .assign(&flags_t);
                    }
                    debug!(
                        "field {field:?} pol {pol} spw {spw:?}: median {:.4}, MAD {:.4}, clipped {newly_flagged}",
                        stats.median, stats.mad
                    );
                }
                clip_stats.windows.push(ClipWindow {
                    field: *field,
                    pol,
                    spw,
                    stats,
                    newly_flagged,
                });
            }
        }
    }
    info!(
        "MAD clipping at {nsig} MADs flagged {} samples, {} now flagged",
        clip_stats.newly_flagged(),
        percent(
            cube.flags.iter().filter(|&&flag| flag).count(),
            cube.flags.len()
        )
    );
    trace!("end mad_clip");
    Ok(clip_stats)
}
