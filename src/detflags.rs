//! Deterministic flags: data known to be bad before looking at it.
//!
//! These are the exact zeros the correlator writes for missing data, the
//! first seconds of each scan while antennas settle (quacking), the roll-off
//! channels at the edges of every spectral window, and a-priori or manual
//! flags given as antenna, time range and spectral window selections.

use std::ops::RangeInclusive;

use log::{debug, info, trace};
use thiserror::Error;

use crate::{
    config::{DetFlagsConfig, ManualFlag},
    marlu::{c32, hifitime::Epoch},
    ndarray::{s, Axis},
    segments::ScanSegmentation,
    util::percent,
    vis::VisCube,
    zscore::ZScoreError,
};

#[derive(Error, Debug)]
/// Errors in deterministic flag selections
pub enum DetFlagError {
    #[error("Invalid time {time:?}, expected YYYY/MM/DD/hh:mm:ss")]
    /// A time couldn't be parsed
    BadTime {
        /// The offending time
        time: String,
    },

    #[error("Invalid time range {timerange:?}: {reason}")]
    /// A time range couldn't be parsed, or ends before it starts
    BadTimerange {
        /// The offending time range
        timerange: String,
        /// What was wrong with it
        reason: String,
    },

    #[error("Invalid spw selection {selection:?}, expected e.g. 0:0~3,2")]
    /// A spectral window selection couldn't be parsed
    BadSpwSelection {
        /// The offending selection
        selection: String,
    },

    #[error("Manual flag {reason:?} selects no antennas, time range or spw, so would flag everything")]
    /// A manual flag has no selections
    EmptySelection {
        /// The reason given for the flag
        reason: String,
    },

    #[error("Can't flag {edge_chans} channels at each edge of {chans_per_spw} channel spectral windows")]
    /// Edge flagging would flag whole spectral windows
    TooManyEdgeChannels {
        /// Channels to flag at each edge
        edge_chans: usize,
        /// Channels in each spectral window
        chans_per_spw: usize,
    },

    #[error(transparent)]
    /// Error derived from [`ZScoreError`]
    ZScoreError(#[from] ZScoreError),
}

/// Parse a CASA time, `YYYY/MM/DD/hh:mm:ss` with optional fractional
/// seconds, as UTC.
///
/// # Examples
///
/// ```rust
/// use vlaflag::detflags::parse_casa_time;
///
/// let epoch = parse_casa_time("2019/03/01/10:30:15.5").unwrap();
/// assert_eq!(epoch.to_gregorian_utc(), (2019, 3, 1, 10, 30, 15, 500_000_000));
/// ```
///
/// # Errors
///
/// Returns [`DetFlagError::BadTime`] if `time` isn't in that format.
pub fn parse_casa_time(time: &str) -> Result<Epoch, DetFlagError> {
    let bad_time = || DetFlagError::BadTime {
        time: time.to_string(),
    };
    let (date, clock) = time.trim().rsplit_once('/').ok_or_else(bad_time)?;
    let date: Vec<&str> = date.split('/').collect();
    let clock: Vec<&str> = clock.split(':').collect();
    let (year, month, day, hour, minute, seconds) = match (&date[..], &clock[..]) {
        ([year, month, day], [hour, minute, seconds]) => (
            year.parse::<i32>().map_err(|_| bad_time())?,
            month.parse::<u8>().map_err(|_| bad_time())?,
            day.parse::<u8>().map_err(|_| bad_time())?,
            hour.parse::<u8>().map_err(|_| bad_time())?,
            minute.parse::<u8>().map_err(|_| bad_time())?,
            seconds.parse::<f64>().map_err(|_| bad_time())?,
        ),
        _ => return Err(bad_time()),
    };
    let valid = (1..=12).contains(&month)
        && (1..=31).contains(&day)
        && hour < 24
        && minute < 60
        && (0.0..60.0).contains(&seconds);
    if !valid {
        return Err(bad_time());
    }
    let whole_seconds = seconds.trunc();
    let nanos = ((seconds - whole_seconds) * 1e9).round() as u32;
    Ok(Epoch::from_gregorian_utc(
        year,
        month,
        day,
        hour,
        minute,
        whole_seconds as u8,
        nanos,
    ))
}

/// Parse a CASA time range, `start~end`, inclusive.
///
/// # Errors
///
/// Returns [`DetFlagError::BadTimerange`] if either time is malformed or the
/// range ends before it starts.
pub fn parse_casa_timerange(timerange: &str) -> Result<RangeInclusive<Epoch>, DetFlagError> {
    let bad_range = |reason: String| DetFlagError::BadTimerange {
        timerange: timerange.to_string(),
        reason,
    };
    let (start, end) = timerange
        .split_once('~')
        .ok_or_else(|| bad_range("expected start~end".into()))?;
    let start = parse_casa_time(start).map_err(|e| bad_range(e.to_string()))?;
    let end = parse_casa_time(end).map_err(|e| bad_range(e.to_string()))?;
    if end < start {
        return Err(bad_range("ends before it starts".into()));
    }
    Ok(start..=end)
}

/// Channels of one spectral window. All channels if `channels` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpwSelection {
    /// Spectral window index
    pub spw: usize,
    /// Inclusive channel range within the spectral window
    pub channels: Option<RangeInclusive<usize>>,
}

/// Parse a CASA spectral window selection: comma separated `spw`, `spw:chan`
/// or `spw:lo~hi` items.
///
/// # Errors
///
/// Returns [`DetFlagError::BadSpwSelection`] for malformed items or
/// backwards channel ranges.
pub fn parse_spw_selection(selection: &str) -> Result<Vec<SpwSelection>, DetFlagError> {
    let bad_selection = || DetFlagError::BadSpwSelection {
        selection: selection.to_string(),
    };
    let parse_idx = |idx: &str| idx.trim().parse::<usize>().map_err(|_| bad_selection());
    selection
        .split(',')
        .map(|item| {
            let (spw, channels) = match item.split_once(':') {
                Some((spw, channels)) => (spw, Some(channels)),
                None => (item, None),
            };
            let channels = match channels {
                None => None,
                Some(channels) => {
                    let (lo, hi) = match channels.split_once('~') {
                        Some((lo, hi)) => (parse_idx(lo)?, parse_idx(hi)?),
                        None => (parse_idx(channels)?, parse_idx(channels)?),
                    };
                    if hi < lo {
                        return Err(bad_selection());
                    }
                    Some(lo..=hi)
                }
            };
            Ok(SpwSelection {
                spw: parse_idx(spw)?,
                channels,
            })
        })
        .collect()
}

/// A [`ManualFlag`] with its selections parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSelection {
    /// Why the data is bad
    pub reason: String,
    /// Antennas whose baselines are flagged, all if empty
    pub antennas: Vec<usize>,
    /// Times which are flagged, all if `None`
    pub timerange: Option<RangeInclusive<Epoch>>,
    /// Channels which are flagged, all if `None`
    pub spws: Option<Vec<SpwSelection>>,
}

impl FlagSelection {
    /// Parse the selections of `flag`.
    ///
    /// # Errors
    ///
    /// Returns a [`DetFlagError`] if a selection is malformed, or if there
    /// are no selections at all.
    pub fn parse(flag: &ManualFlag) -> Result<Self, DetFlagError> {
        if flag.antennas.is_empty() && flag.timerange.is_none() && flag.spw.is_none() {
            return Err(DetFlagError::EmptySelection {
                reason: flag.reason.clone(),
            });
        }
        Ok(Self {
            reason: flag.reason.clone(),
            antennas: flag.antennas.clone(),
            timerange: flag
                .timerange
                .as_deref()
                .map(parse_casa_timerange)
                .transpose()?,
            spws: flag.spw.as_deref().map(parse_spw_selection).transpose()?,
        })
    }

    /// Flag everything in `cube` this selects. Returns the number of newly
    /// flagged samples.
    pub fn apply(&self, cube: &mut VisCube) -> usize {
        let baselines: Vec<usize> = cube
            .ant_pairs
            .iter()
            .enumerate()
            .filter(|(_, (ant1, ant2))| {
                self.antennas.is_empty()
                    || self.antennas.contains(ant1)
                    || self.antennas.contains(ant2)
            })
            .map(|(bl, _)| bl)
            .collect();
        let times: Vec<usize> = cube
            .timestamps
            .iter()
            .enumerate()
            .filter(|(_, epoch)| {
                self.timerange
                    .as_ref()
                    .map_or(true, |timerange| timerange.contains(*epoch))
            })
            .map(|(t, _)| t)
            .collect();
        let chans_per_spw = cube.chans_per_spw;
        let freqs: Vec<usize> = match &self.spws {
            None => (0..cube.num_freqs()).collect(),
            Some(spws) => spws
                .iter()
                .filter(|sel| sel.spw < cube.num_spws())
                .flat_map(|sel| {
                    let channels = sel
                        .channels
                        .clone()
                        .unwrap_or(0..=chans_per_spw.saturating_sub(1));
                    channels
                        .filter(|&chan| chan < chans_per_spw)
                        .map(move |chan| sel.spw * chans_per_spw + chan)
                })
                .collect(),
        };

        let mut newly_flagged = 0;
        for mut flags_pol in cube.flags.outer_iter_mut() {
            for &bl in &baselines {
                for &t in &times {
                    for &f in &freqs {
                        let flag = &mut flags_pol[[bl, t, f]];
                        if !*flag {
                            *flag = true;
                            newly_flagged += 1;
                        }
                    }
                }
            }
        }
        newly_flagged
    }
}

/// Flag every visibility which is exactly zero. Returns the number of newly
/// flagged samples.
pub fn clip_zeros(cube: &mut VisCube) -> usize {
    let zero = c32::new(0.0, 0.0);
    let mut newly_flagged = 0;
    cube.flags.zip_mut_with(&cube.vis, |flag, &vis| {
        if !*flag && vis == zero {
            *flag = true;
            newly_flagged += 1;
        }
    });
    newly_flagged
}

/// Flag the timesteps within `quack_s` seconds of the first timestep of each
/// scan. Without scan lengths, the observation is one scan. Returns the
/// number of newly flagged samples.
///
/// # Errors
///
/// Returns [`ZScoreError`] if the cube's scans don't cover its time axis.
pub fn quack(cube: &mut VisCube, quack_s: f64) -> Result<usize, ZScoreError> {
    let num_timesteps = cube.num_timesteps();
    if quack_s <= 0.0 || num_timesteps == 0 {
        return Ok(0);
    }
    let scans = match &cube.scans {
        Some(scans) => scans.clone(),
        None => ScanSegmentation::whole(num_timesteps)?,
    };
    scans.validate(num_timesteps)?;
    let mut newly_flagged = 0;
    for range in scans.ranges() {
        let scan_start = cube.timestamps[range.start];
        for t in range {
            if (cube.timestamps[t] - scan_start).to_seconds() >= quack_s {
                break;
            }
            for flag in cube.flags.slice_mut(s![.., .., t, ..]).iter_mut() {
                if !*flag {
                    *flag = true;
                    newly_flagged += 1;
                }
            }
        }
    }
    Ok(newly_flagged)
}

/// Flag `edge_chans` channels at both edges of every spectral window. Returns
/// the number of newly flagged samples.
///
/// # Errors
///
/// Returns [`DetFlagError::TooManyEdgeChannels`] if that would flag whole
/// spectral windows.
pub fn flag_spw_edges(cube: &mut VisCube, edge_chans: usize) -> Result<usize, DetFlagError> {
    let chans_per_spw = cube.chans_per_spw;
    if edge_chans == 0 {
        return Ok(0);
    }
    if 2 * edge_chans >= chans_per_spw {
        return Err(DetFlagError::TooManyEdgeChannels {
            edge_chans,
            chans_per_spw,
        });
    }
    let mut newly_flagged = 0;
    for (f, mut flags_chan) in cube.flags.axis_iter_mut(Axis(3)).enumerate() {
        let chan = f % chans_per_spw;
        if chan >= edge_chans && chan < chans_per_spw - edge_chans {
            continue;
        }
        for flag in flags_chan.iter_mut() {
            if !*flag {
                *flag = true;
                newly_flagged += 1;
            }
        }
    }
    Ok(newly_flagged)
}

/// How many samples one kind of deterministic flag added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetFlagCount {
    /// What was flagged
    pub reason: String,
    /// Samples which weren't flagged before
    pub newly_flagged: usize,
}

/// The result of [`det_flags`], in the order the flags were applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetFlagStats {
    /// One entry per kind of flag
    pub counts: Vec<DetFlagCount>,
}

impl DetFlagStats {
    /// The total number of newly flagged samples.
    pub fn newly_flagged(&self) -> usize {
        self.counts.iter().map(|count| count.newly_flagged).sum()
    }

    fn push(&mut self, reason: &str, newly_flagged: usize) {
        debug!("{reason}: flagged {newly_flagged}");
        self.counts.push(DetFlagCount {
            reason: reason.to_string(),
            newly_flagged,
        });
    }
}

/// Apply the deterministic flags of `config` to `cube`: zero clipping,
/// quacking, manual flags, then spectral window edges.
///
/// # Errors
///
/// Returns a [`DetFlagError`] if the cube is inconsistent or a selection is
/// malformed. Nothing is flagged in that case.
pub fn det_flags(cube: &mut VisCube, config: &DetFlagsConfig) -> Result<DetFlagStats, DetFlagError> {
    trace!("start det_flags");
    cube.validate()?;
    let selections = config
        .manual
        .iter()
        .map(FlagSelection::parse)
        .collect::<Result<Vec<_>, _>>()?;
    if config.edge_chans > 0 && 2 * config.edge_chans >= cube.chans_per_spw {
        return Err(DetFlagError::TooManyEdgeChannels {
            edge_chans: config.edge_chans,
            chans_per_spw: cube.chans_per_spw,
        });
    }

    let mut stats = DetFlagStats::default();
    if config.clip_zeros {
        stats.push("Zero Clipping", clip_zeros(cube));
    }
    if config.quack_s > 0.0 {
        stats.push("Quacking", quack(cube, config.quack_s)?);
    }
    for selection in &selections {
        stats.push(&selection.reason, selection.apply(cube));
    }
    if config.edge_chans > 0 {
        stats.push(
            "Flag SPW Edge Channels",
            flag_spw_edges(cube, config.edge_chans)?,
        );
    }
    info!(
        "deterministic flags added {} samples, {} now flagged",
        stats.newly_flagged(),
        percent(
            cube.flags.iter().filter(|&&flag| flag).count(),
            cube.flags.len()
        )
    );
    trace!("end det_flags");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        marlu::hifitime::Duration,
        test_common::{synthetic_cube, test_timestamps, TEST_INT_TIME_S},
    };

    fn manual_flag(antennas: Vec<usize>, timerange: Option<&str>, spw: Option<&str>) -> ManualFlag {
        ManualFlag {
            reason: "test".into(),
            antennas,
            timerange: timerange.map(Into::into),
            spw: spw.map(Into::into),
        }
    }

    #[test]
    fn test_parse_casa_time() {
        let epoch = parse_casa_time("2019/03/01/10:30:15").unwrap();
        assert_eq!(epoch.to_gregorian_utc(), (2019, 3, 1, 10, 30, 15, 0));
        for bad in [
            "2019/03/01",
            "2019-03-01T10:30:15",
            "2019/13/01/10:30:15",
            "2019/03/01/10:61:00",
            "2019/03/01/10:30",
            "",
        ] {
            assert!(parse_casa_time(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_parse_casa_timerange() {
        let range = parse_casa_timerange("2019/03/01/10:00:00~2019/03/01/10:30:00").unwrap();
        assert_eq!((*range.end() - *range.start()).to_seconds(), 1800.0);
        assert!(matches!(
            parse_casa_timerange("2019/03/01/10:30:00~2019/03/01/10:00:00"),
            Err(DetFlagError::BadTimerange { .. })
        ));
        assert!(matches!(
            parse_casa_timerange("2019/03/01/10:30:00"),
            Err(DetFlagError::BadTimerange { .. })
        ));
    }

    #[test]
    fn test_parse_spw_selection() {
        assert_eq!(
            parse_spw_selection("0:0~3,2,5:7").unwrap(),
            vec![
                SpwSelection {
                    spw: 0,
                    channels: Some(0..=3)
                },
                SpwSelection {
                    spw: 2,
                    channels: None
                },
                SpwSelection {
                    spw: 5,
                    channels: Some(7..=7)
                },
            ]
        );
        for bad in ["", "a", "0:3~1", "0:", "1:2~"] {
            assert!(
                matches!(
                    parse_spw_selection(bad),
                    Err(DetFlagError::BadSpwSelection { .. })
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_clip_zeros() {
        let mut cube = synthetic_cube(2, 3, 4, 8, 4);
        cube.vis[[0, 1, 2, 3]] = c32::new(0.0, 0.0);
        cube.vis[[1, 0, 0, 0]] = c32::new(0.0, 0.0);
        cube.flags[[1, 0, 0, 0]] = true;
        assert_eq!(clip_zeros(&mut cube), 1);
        assert!(cube.flags[[0, 1, 2, 3]]);
        assert_eq!(cube.flags.iter().filter(|&&f| f).count(), 2);
    }

    #[test]
    fn test_quack_flags_start_of_each_scan() {
        let mut cube = synthetic_cube(2, 3, 10, 8, 4);
        cube.scans = Some(ScanSegmentation::new(vec![6, 4]).unwrap());
        // timesteps are TEST_INT_TIME_S apart, so this covers two of each scan
        let newly_flagged = quack(&mut cube, 1.5 * TEST_INT_TIME_S).unwrap();
        assert_eq!(newly_flagged, 4 * 2 * 3 * 8);
        for t in 0..10 {
            let flagged = cube.flags.slice(s![.., .., t, ..]).iter().all(|&f| f);
            assert_eq!(flagged, [0, 1, 6, 7].contains(&t), "timestep {t}");
        }
        assert_eq!(quack(&mut cube, 0.0).unwrap(), 0);
    }

    #[test]
    fn test_spw_edges() {
        let mut cube = synthetic_cube(1, 2, 3, 16, 8);
        assert_eq!(flag_spw_edges(&mut cube, 2).unwrap(), 2 * 2 * 4 * 3);
        for f in 0..16 {
            let flagged = cube.flags.slice(s![.., .., .., f]).iter().all(|&f| f);
            assert_eq!(flagged, [0, 1, 6, 7, 8, 9, 14, 15].contains(&f), "channel {f}");
        }
        assert!(matches!(
            flag_spw_edges(&mut cube, 4),
            Err(DetFlagError::TooManyEdgeChannels { .. })
        ));
    }

    #[test]
    fn test_manual_flag_selects_antenna_time_and_spw() {
        let mut cube = synthetic_cube(2, 6, 10, 16, 8);
        // from half an integration before timestep 3 onwards
        let start = test_timestamps(10)[3] - Duration::from_seconds(TEST_INT_TIME_S / 2.0);
        let (y, mo, d, h, mi, sec, nanos) = start.to_gregorian_utc();
        let timerange =
            format!("{y:04}/{mo:02}/{d:02}/{h:02}:{mi:02}:{sec:02}.{nanos:09}~2100/01/01/00:00:00");
        let flag = manual_flag(vec![3], Some(timerange.as_str()), Some("1:0~1"));
        let selection = FlagSelection::parse(&flag).unwrap();
        let newly_flagged = selection.apply(&mut cube);

        let ant3_baselines: Vec<usize> = cube
            .ant_pairs
            .iter()
            .enumerate()
            .filter(|(_, &(a1, a2))| a1 == 3 || a2 == 3)
            .map(|(bl, _)| bl)
            .collect();
        assert!(!ant3_baselines.is_empty());
        // timesteps 3..10, channels 8 and 9
        assert_eq!(newly_flagged, 2 * ant3_baselines.len() * 7 * 2);
        assert!(cube.flags[[1, ant3_baselines[0], 9, 9]]);
        assert!(!cube.flags[[1, ant3_baselines[0], 2, 9]]);
        assert!(!cube.flags[[1, ant3_baselines[0], 9, 10]]);

        // applying again adds nothing
        assert_eq!(selection.apply(&mut cube), 0);
        assert!(matches!(
            FlagSelection::parse(&manual_flag(vec![], None, None)),
            Err(DetFlagError::EmptySelection { .. })
        ));
    }

    #[test]
    fn test_det_flags_applies_each_kind() {
        let mut cube = synthetic_cube(2, 3, 10, 16, 8);
        cube.scans = Some(ScanSegmentation::new(vec![5, 5]).unwrap());
        cube.vis[[0, 0, 4, 4]] = c32::new(0.0, 0.0);
        let config = DetFlagsConfig {
            clip_zeros: true,
            quack_s: 1.0,
            edge_chans: 1,
            manual: vec![manual_flag(vec![], None, Some("0:5"))],
        };
        let stats = det_flags(&mut cube, &config).unwrap();
        let reasons: Vec<&str> = stats.counts.iter().map(|c| c.reason.as_str()).collect();
        assert_eq!(
            reasons,
            ["Zero Clipping", "Quacking", "test", "Flag SPW Edge Channels"]
        );
        assert_eq!(stats.counts[0].newly_flagged, 1);
        // the first timestep of both scans
        assert_eq!(stats.counts[1].newly_flagged, 2 * 2 * 3 * 16);
        assert_eq!(
            stats.newly_flagged(),
            cube.flags.iter().filter(|&&f| f).count()
        );

        let too_wide = DetFlagsConfig {
            edge_chans: 4,
            ..config
        };
        let before = cube.flags.clone();
        assert!(det_flags(&mut cube, &too_wide).is_err());
        assert_eq!(cube.flags, before);
    }
}
