//! End to end operations on a measurement set: compute and cache the
//! modified Z-score, flag from a cached Z-score, MAD clip, and apply
//! deterministic flags.

use std::path::{Path, PathBuf};

use log::{debug, info, trace};

use crate::{
    clip::{mad_clip, ClipStats},
    config::{DetFlagsConfig, MadClipConfig, ZScoreConfig},
    constants::{DEFAULT_OUTPUT_DIR, DISABLE_THRESHOLD, ZSCORE_FLAG_REASON},
    detflags::{det_flags, DetFlagStats},
    flag_ranges::{coalesce_flag_ranges, summarise_flag_ranges, FlagRange},
    io::{
        read_zscore_cache, write_flag_commands, zscore_cache_path, IOError,
        MeasurementSetReader,
    },
    vis::{DataColumn, FlagWriter, VisReader},
    zscore::ZScoreCube,
    VlaFlagError,
};

/// What to do with the flag ranges found by [`flag_from_zscore_with`].
#[derive(Debug, Clone, Default)]
pub struct FlagOutput {
    /// Also write the ranges as CASA flag commands to this file
    pub flag_cmds: Option<PathBuf>,
    /// Don't modify the measurement set
    pub no_apply: bool,
}

/// Compute the modified Z-score of the measurement set at `ms_path` and cache
/// it, or reuse an existing cache. Returns the cache path and the Z-score.
///
/// # Errors
///
/// Propagates read, compute and cache errors.
pub fn compute_zscore_with(
    ms_path: &Path,
    config: &ZScoreConfig,
    draw_progress: bool,
) -> Result<(PathBuf, ZScoreCube), VlaFlagError> {
    trace!("start compute_zscore_with");
    let cache_path = zscore_cache_path(ms_path, &config.output_dir, config.data_column);
    let ctx = config.context(draw_progress);
    debug!("modified Z-score options:\n{}", ctx);
    let mut reader = MeasurementSetReader::new(ms_path)?;
    reader.draw_progress = draw_progress;
    let zscore = ctx.compute_cached(&reader, &cache_path)?;
    trace!("end compute_zscore_with");
    Ok((cache_path, zscore))
}

/// Compute the modified Z-score of `data_column` of the measurement set at
/// `ms_path`, caching it in the default output directory next to it.
/// An existing cache is kept unless `overwrite`. Returns the cache path.
///
/// # Errors
///
/// Propagates read, compute and cache errors.
pub fn compute_zscore(
    ms_path: &Path,
    data_column: DataColumn,
    masked: bool,
    overwrite: bool,
) -> Result<PathBuf, VlaFlagError> {
    let config = ZScoreConfig {
        data_column,
        masked,
        overwrite,
        ..Default::default()
    };
    let (cache_path, _) = compute_zscore_with(ms_path, &config, false)?;
    Ok(cache_path)
}

/// Flag the measurement set at `ms_path` wherever its cached, baseline
/// averaged Z-score exceeds `config.threshold`. Returns the flag ranges.
///
/// A threshold at or above [`DISABLE_THRESHOLD`] flags nothing.
///
/// # Errors
///
/// Returns an error if the cache is missing or unreadable, was computed from
/// another measurement set or doesn't match this one's time and frequency
/// axes, the threshold is invalid, or the flags can't be written.
pub fn flag_from_zscore_with(
    ms_path: &Path,
    config: &ZScoreConfig,
    output: &FlagOutput,
    draw_progress: bool,
) -> Result<Vec<FlagRange>, VlaFlagError> {
    trace!("start flag_from_zscore_with");
    let cache_path = zscore_cache_path(ms_path, &config.output_dir, config.data_column);
    info!("reading modified Z-score {}", cache_path.display());
    let zscore = read_zscore_cache(&cache_path)?;
    let mut writer = MeasurementSetReader::new(ms_path)?;
    writer.draw_progress = draw_progress;
    writer.check_zscore(&zscore)?;
    let ranges = zscore.flag_ranges(config.threshold)?;
    if config.threshold >= DISABLE_THRESHOLD {
        info!(
            "Z-score threshold {} disables flagging, nothing to do",
            config.threshold
        );
        return Ok(vec![]);
    }
    let ranges: Vec<FlagRange> = if config.coalesce {
        coalesce_flag_ranges(ranges)
    } else {
        ranges.collect()
    };
    info!(
        "found {} flag ranges where |z| > {}",
        ranges.len(),
        config.threshold
    );
    debug!("flag ranges per spectral window:\n{}", summarise_flag_ranges(&ranges));

    if let Some(flag_cmds) = &output.flag_cmds {
        write_flag_commands(flag_cmds, &ranges, ZSCORE_FLAG_REASON)?;
        info!("wrote flag commands to {}", flag_cmds.display());
    }
    if output.no_apply {
        info!("not applying flags to {}", ms_path.display());
    } else {
        writer.write_flag_ranges(&ranges)?;
    }
    trace!("end flag_from_zscore_with");
    Ok(ranges)
}

/// Flag the measurement set at `ms_path` from the cached Z-score of its
/// corrected data, wherever `|z| > threshold`. Returns the number of flag
/// ranges applied.
///
/// # Errors
///
/// see [`flag_from_zscore_with`]
pub fn flag_from_zscore(ms_path: &Path, threshold: f64) -> Result<usize, VlaFlagError> {
    let config = ZScoreConfig {
        data_column: DataColumn::Corrected,
        threshold,
        output_dir: DEFAULT_OUTPUT_DIR.into(),
        ..Default::default()
    };
    let ranges = flag_from_zscore_with(ms_path, &config, &FlagOutput::default(), false)?;
    Ok(ranges.len())
}

/// Field indices for `requested`, each either a name from the FIELD table or
/// an index into it.
fn resolve_fields(requested: &[String], available: &[String]) -> Result<Vec<usize>, IOError> {
    requested
        .iter()
        .map(|field| {
            available
                .iter()
                .position(|name| name == field)
                .or_else(|| {
                    field
                        .parse::<usize>()
                        .ok()
                        .filter(|&idx| idx < available.len())
                })
                .ok_or_else(|| IOError::UnknownField {
                    field: field.clone(),
                    available: available.to_vec(),
                })
        })
        .collect()
}

/// MAD clip `data_column` of the measurement set at `ms_path` and merge the
/// new flags into it, unless `dry_run`. Only `config.fields` are clipped, if
/// given.
///
/// # Errors
///
/// Returns [`IOError::UnknownField`] if a field isn't in the measurement set,
/// and propagates read, clip and write errors.
pub fn mad_clip_ms(
    ms_path: &Path,
    data_column: DataColumn,
    config: &MadClipConfig,
    dry_run: bool,
    draw_progress: bool,
) -> Result<ClipStats, VlaFlagError> {
    trace!("start mad_clip_ms");
    let mut reader = MeasurementSetReader::new(ms_path)?;
    reader.draw_progress = draw_progress;
    let fields = config
        .fields
        .as_deref()
        .map(|fields| resolve_fields(fields, reader.field_names()))
        .transpose()?;
    if let Some(fields) = &fields {
        debug!("clipping fields {:?}", fields);
    }
    let mut cube = reader.read_vis(data_column)?;
    let clip_stats = mad_clip(&mut cube, config.nsig, config.per_spw, fields.as_deref())?;
    if dry_run {
        info!("not applying flags to {}", ms_path.display());
    } else if clip_stats.newly_flagged() > 0 {
        reader.write_flag_cube(&cube)?;
    }
    trace!("end mad_clip_ms");
    Ok(clip_stats)
}

/// Apply the deterministic flags of `config` to `data_column` of the
/// measurement set at `ms_path`, merging them into it unless `dry_run`.
///
/// # Errors
///
/// Propagates read, selection and write errors.
pub fn det_flags_ms(
    ms_path: &Path,
    data_column: DataColumn,
    config: &DetFlagsConfig,
    dry_run: bool,
    draw_progress: bool,
) -> Result<DetFlagStats, VlaFlagError> {
    trace!("start det_flags_ms");
    let mut reader = MeasurementSetReader::new(ms_path)?;
    reader.draw_progress = draw_progress;
    let mut cube = reader.read_vis(data_column)?;
    let stats = det_flags(&mut cube, config)?;
    if dry_run {
        info!("not applying flags to {}", ms_path.display());
    } else if stats.newly_flagged() > 0 {
        reader.write_flag_cube(&cube)?;
    }
    trace!("end det_flags_ms");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ManualFlag,
        io::{ms::tests::write_test_ms, write_zscore_cache},
        marlu::rubbl_casatables::{Table, TableOpenMode},
        ndarray::{s, Array2},
    };
    use std::fs::{copy, create_dir_all, read_to_string};
    use tempfile::tempdir;

    fn count_flags(ms: &Path) -> usize {
        let mut main_table = Table::open(ms, TableOpenMode::Read).unwrap();
        (0..main_table.n_rows())
            .map(|row| {
                let flags: Array2<bool> = main_table.get_cell("FLAG", row).unwrap();
                flags.iter().filter(|&&f| f).count()
            })
            .sum()
    }

    #[test]
    fn test_compute_zscore_caches_next_to_ms() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);

        let cache_path = compute_zscore(&ms, DataColumn::Corrected, true, false).unwrap();
        assert_eq!(
            cache_path,
            tmp_dir.path().join("output").join("test").join("z_score_corrected.fits")
        );
        let cached = read_zscore_cache(&cache_path).unwrap();
        assert_eq!(cached.zscore.dim(), (2, 3, 4, 8));
        assert_eq!(cached.scans.lengths(), &[2, 2]);
        assert!(cached.masked);
    }

    #[test]
    fn test_existing_cache_reused_unless_overwrite() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let cache_path = compute_zscore(&ms, DataColumn::Data, true, false).unwrap();

        let mut stale = read_zscore_cache(&cache_path).unwrap();
        stale.zscore_avg.fill(42.0);
        write_zscore_cache(&stale, &cache_path).unwrap();

        compute_zscore(&ms, DataColumn::Data, true, false).unwrap();
        let reused = read_zscore_cache(&cache_path).unwrap();
        assert!(reused.zscore_avg.iter().all(|&z| z == 42.0));

        compute_zscore(&ms, DataColumn::Data, true, true).unwrap();
        let fresh = read_zscore_cache(&cache_path).unwrap();
        assert!(fresh.zscore_avg.iter().all(|&z| z != 42.0));
    }

    #[test]
    fn test_flag_from_zscore() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        compute_zscore(&ms, DataColumn::Corrected, true, false).unwrap();
        let flags_before = count_flags(&ms);

        // two samples per scan always sit 0.6745 sigma either side of the median
        assert_eq!(flag_from_zscore(&ms, 5.0).unwrap(), 0);
        assert_eq!(flag_from_zscore(&ms, 1e6).unwrap(), 0);
        assert_eq!(count_flags(&ms), flags_before);

        assert_eq!(flag_from_zscore(&ms, 0.5).unwrap(), 4 * 8);
        // every row, channel and correlation
        assert_eq!(count_flags(&ms), 4 * 2 * 4 * 4 * 4);
    }

    #[test]
    fn test_flag_without_cache_fails() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        assert!(matches!(
            flag_from_zscore(&ms, 5.0),
            Err(VlaFlagError::IOError(IOError::FitsIO { .. }))
        ));
    }

    #[test]
    fn test_flag_cmds_without_applying() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let config = ZScoreConfig {
            threshold: 0.5,
            coalesce: true,
            ..Default::default()
        };
        compute_zscore_with(&ms, &config, false).unwrap();
        let flags_before = count_flags(&ms);

        let flag_cmds = tmp_dir.path().join("zscore.flagcmd");
        let output = FlagOutput {
            flag_cmds: Some(flag_cmds.clone()),
            no_apply: true,
        };
        let ranges = flag_from_zscore_with(&ms, &config, &output, false).unwrap();
        // coalesced: one range per channel covering all four timesteps
        assert_eq!(ranges.len(), 8);
        assert!(ranges
            .iter()
            .all(|range| (range.start_idx, range.end_idx) == (0, 3)));
        assert_eq!(read_to_string(&flag_cmds).unwrap().lines().count(), 8);
        assert_eq!(count_flags(&ms), flags_before);
    }

    #[test]
    fn test_mad_clip_ms() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let flags_before = count_flags(&ms);

        let config = MadClipConfig {
            nsig: 1.0,
            per_spw: true,
            fields: None,
        };
        let dry = mad_clip_ms(&ms, DataColumn::Data, &config, true, false).unwrap();
        assert!(dry.newly_flagged() > 0);
        assert_eq!(count_flags(&ms), flags_before);

        let applied = mad_clip_ms(&ms, DataColumn::Data, &config, false, false).unwrap();
        assert_eq!(applied.newly_flagged(), dry.newly_flagged());
        assert_eq!(count_flags(&ms), flags_before + applied.newly_flagged());
    }

    #[test]
    fn test_compute_unmasked_after_masked_recomputes() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let cache_path = compute_zscore(&ms, DataColumn::Corrected, true, false).unwrap();
        assert!(read_zscore_cache(&cache_path).unwrap().masked);

        assert_eq!(
            compute_zscore(&ms, DataColumn::Corrected, false, false).unwrap(),
            cache_path
        );
        let cached = read_zscore_cache(&cache_path).unwrap();
        assert!(!cached.masked);
        // the one flagged sample no longer masks anything
        assert!(!cached.mask.iter().any(|&m| m));
    }

    #[test]
    fn test_cache_of_another_ms_is_rejected() {
        let tmp_dir = tempdir().unwrap();
        let ms_a = tmp_dir.path().join("a.ms");
        let ms_b = tmp_dir.path().join("b.ms");
        write_test_ms(&ms_a);
        write_test_ms(&ms_b);
        let cache_a = compute_zscore(&ms_a, DataColumn::Corrected, true, false).unwrap();
        let cache_b = zscore_cache_path(&ms_b, DEFAULT_OUTPUT_DIR, DataColumn::Corrected);
        assert_ne!(cache_a, cache_b);

        create_dir_all(cache_b.parent().unwrap()).unwrap();
        copy(&cache_a, &cache_b).unwrap();
        let flags_before = count_flags(&ms_b);
        assert!(matches!(
            flag_from_zscore(&ms_b, 0.5),
            Err(VlaFlagError::IOError(IOError::ZScoreMismatch { what, .. })) if what == "source"
        ));
        assert_eq!(count_flags(&ms_b), flags_before);

        // computing for b replaces the copied cache
        compute_zscore(&ms_b, DataColumn::Corrected, true, false).unwrap();
        assert_eq!(flag_from_zscore(&ms_b, 0.5).unwrap(), 4 * 8);
    }

    #[test]
    fn test_cache_with_other_axes_is_rejected() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let cache_path = compute_zscore(&ms, DataColumn::Corrected, true, false).unwrap();

        let mut cached = read_zscore_cache(&cache_path).unwrap();
        cached.timestamps.truncate(3);
        cached.zscore_avg = cached.zscore_avg.slice(s![..3, ..]).to_owned();
        cached.mask_avg = cached.mask_avg.slice(s![..3, ..]).to_owned();
        cached.zscore = cached.zscore.slice(s![.., .., ..3, ..]).to_owned();
        cached.mask = cached.mask.slice(s![.., .., ..3, ..]).to_owned();
        cached.scans = crate::ScanSegmentation::new(vec![2, 1]).unwrap();
        write_zscore_cache(&cached, &cache_path).unwrap();

        assert!(matches!(
            flag_from_zscore(&ms, 0.5),
            Err(VlaFlagError::IOError(IOError::ZScoreMismatch { what, .. })) if what == "timestamps"
        ));
    }

    #[test]
    fn test_mad_clip_ms_selected_field() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let config = MadClipConfig {
            nsig: 1.0,
            per_spw: true,
            fields: Some(vec!["J1407+2827".into()]),
        };
        let clip_stats = mad_clip_ms(&ms, DataColumn::Data, &config, false, false).unwrap();
        assert!(clip_stats.newly_flagged() > 0);
        assert!(clip_stats.windows.iter().all(|window| window.field == Some(1)));

        let mut reader = MeasurementSetReader::new(&ms).unwrap();
        reader.draw_progress = false;
        let cube = reader.read_vis(DataColumn::Data).unwrap();
        // only the flag already there on the first field
        let first_field = cube.flags.slice(s![.., .., ..2, ..]);
        assert_eq!(first_field.iter().filter(|&&f| f).count(), 1);

        let by_index = MadClipConfig {
            fields: Some(vec!["1".into()]),
            ..config.clone()
        };
        let dry = mad_clip_ms(&ms, DataColumn::Data, &by_index, true, false).unwrap();
        assert!(dry.windows.iter().all(|window| window.field == Some(1)));

        let unknown = MadClipConfig {
            fields: Some(vec!["NGC1234".into()]),
            ..config
        };
        assert!(matches!(
            mad_clip_ms(&ms, DataColumn::Data, &unknown, true, false),
            Err(VlaFlagError::IOError(IOError::UnknownField { field, .. })) if field == "NGC1234"
        ));
    }

    #[test]
    fn test_resolve_fields() {
        let available = vec!["3C286".to_string(), "J1407+2827".to_string()];
        assert_eq!(
            resolve_fields(&["J1407+2827".into(), "0".into()], &available).unwrap(),
            vec![1, 0]
        );
        assert!(resolve_fields(&["2".into()], &available).is_err());
    }

    #[test]
    fn test_det_flags_ms() {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let flags_before = count_flags(&ms);
        let config = DetFlagsConfig {
            clip_zeros: true,
            quack_s: 1.0,
            edge_chans: 1,
            manual: vec![ManualFlag {
                reason: "bad antenna".into(),
                antennas: vec![2],
                timerange: None,
                spw: Some("1:1".into()),
            }],
        };

        let dry = det_flags_ms(&ms, DataColumn::Corrected, &config, true, false).unwrap();
        assert_eq!(count_flags(&ms), flags_before);
        // the first timestep of both scans, less the sample already flagged
        assert_eq!(dry.counts[1].newly_flagged, 2 * 2 * 3 * 8 - 1);
        // baselines (0, 2) and (1, 2) at the two remaining timesteps
        assert_eq!(dry.counts[2].newly_flagged, 2 * 2 * 2);
        // channels 0, 3, 4 and 7 at the two remaining timesteps
        assert_eq!(dry.counts[3].newly_flagged, 2 * 3 * 2 * 4);

        let applied = det_flags_ms(&ms, DataColumn::Corrected, &config, false, false).unwrap();
        assert_eq!(applied, dry);
        let mut reader = MeasurementSetReader::new(&ms).unwrap();
        reader.draw_progress = false;
        let cube = reader.read_vis(DataColumn::Corrected).unwrap();
        assert_eq!(
            cube.flags.iter().filter(|&&f| f).count(),
            1 + applied.newly_flagged()
        );
    }
}
