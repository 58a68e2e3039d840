//! Command Line Interface helpers for vlaflag

use crate::{
    clip::ClipStats,
    config::PipelineConfig,
    detflags::DetFlagStats,
    error::{CLIError::InvalidCommandLineArgument, VlaFlagError, VlaFlagError::DryRun},
    flag_ranges::FlagRange,
    io::zscore_cache_path,
    pipeline::{compute_zscore_with, det_flags_ms, flag_from_zscore_with, mad_clip_ms, FlagOutput},
    vis::DataColumn,
};
use clap::{arg, command, ArgMatches, Command, ErrorKind::ArgumentNotFound, ValueHint};
use itertools::Itertools;
use log::{debug, info, trace};
use prettytable::{cell, format as prettyformat, row, table, Table};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    fmt::{Debug, Display},
    path::PathBuf,
    str::FromStr,
};

/// What to do to the measurement set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Compute and cache the modified Z-score
    ZScore,
    /// Flag from the cached modified Z-score
    ZClip(FlagOutputArgs),
    /// MAD clip visibility amplitudes
    MadClip,
    /// Apply deterministic flags
    DetFlags,
}

/// Outputs of the `zclip` subcommand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagOutputArgs {
    /// Write CASA flag commands here
    pub flag_cmds: Option<PathBuf>,
    /// Don't modify the measurement set
    pub no_apply: bool,
}

/// Args for one vlaflag run.
#[derive(Debug, Clone)]
pub struct VlaFlagContext {
    /// Path to the measurement set
    pub ms_path: PathBuf,
    /// The subcommand
    pub task: Task,
    /// Options from the config file, overridden by the command line
    pub config: PipelineConfig,
    /// Whether to draw progress bars
    pub draw_progress: bool,
}

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (GIT_HEAD_REF, GIT_COMMIT_HASH) {
        (Some(hr), Some(hash)) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                hash,
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {hr}")?;
        }
        _ => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {BUILT_TIME_UTC}")?;
    writeln!(f, "         with compiler {RUSTC_VERSION}")?;
    writeln!(f)?;
    Ok(())
}

impl Display for VlaFlagContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        writeln!(f, "Measurement set:      {}", self.ms_path.display())?;
        let zscore = &self.config.zscore;
        match &self.task {
            Task::ZScore => {
                writeln!(
                    f,
                    "Will compute the modified Z-score of the {} column{}",
                    zscore.data_column,
                    if zscore.masked { ", masking flags" } else { "" }
                )?;
                writeln!(
                    f,
                    "Z-score cache:        {}{}",
                    zscore_cache_path(&self.ms_path, &zscore.output_dir, zscore.data_column)
                        .display(),
                    if zscore.overwrite {
                        " (overwrite)"
                    } else {
                        ""
                    }
                )?;
            }
            Task::ZClip(output) => {
                writeln!(
                    f,
                    "Will flag where the {} Z-score exceeds {}{}",
                    zscore.data_column,
                    zscore.threshold,
                    if zscore.coalesce {
                        ", coalescing ranges"
                    } else {
                        ""
                    }
                )?;
                if let Some(flag_cmds) = &output.flag_cmds {
                    writeln!(f, "Flag commands:        {}", flag_cmds.display())?;
                }
                if output.no_apply {
                    writeln!(f, "Will not apply flags to the measurement set")?;
                }
            }
            Task::MadClip => {
                let madclip = &self.config.madclip;
                writeln!(
                    f,
                    "Will MAD clip the {} column beyond {} MADs, {}",
                    zscore.data_column,
                    madclip.nsig,
                    if madclip.per_spw {
                        "per spectral window"
                    } else {
                        "across all spectral windows"
                    }
                )?;
                match &madclip.fields {
                    Some(fields) => writeln!(f, "Fields:               {}", fields.join(", "))?,
                    None => writeln!(f, "Fields:               all, each separately")?,
                }
            }
            Task::DetFlags => {
                let detflags = &self.config.detflags;
                writeln!(
                    f,
                    "Will apply deterministic flags using the {} column",
                    zscore.data_column
                )?;
                writeln!(
                    f,
                    "Zero clipping:        {}",
                    if detflags.clip_zeros { "yes" } else { "no" }
                )?;
                writeln!(f, "Quack:                {}s", detflags.quack_s)?;
                writeln!(f, "Edge channels:        {}", detflags.edge_chans)?;
                for flag in &detflags.manual {
                    writeln!(f, "Manual flag:          {}", flag.reason)?;
                }
            }
        }
        Ok(())
    }
}

/// A table of how many ranges flag each spectral window, and their largest |z|.
fn flag_range_table(ranges: &[FlagRange]) -> Table {
    let mut spw_table = table!(["spw", "ranges", "channels", "max |z|"]);
    spw_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    let mut per_spw: BTreeMap<usize, (usize, BTreeSet<usize>, f64)> = BTreeMap::new();
    for range in ranges {
        let (count, channels, max_z) = per_spw.entry(range.spw).or_default();
        *count += 1;
        channels.insert(range.channel);
        *max_z = max_z.max(range.zscore.abs());
    }
    for (spw, (count, channels, max_z)) in per_spw {
        spw_table.add_row(row![r => spw, count, channels.len(), format!("{max_z:.2}")]);
    }
    spw_table
}

/// A table of the statistics and new flags of each clipping window.
fn clip_table(clip_stats: &ClipStats) -> Table {
    let mut window_table = table!(["field", "pol", "spw", "median", "MAD", "flagged"]);
    window_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for window in &clip_stats.windows {
        window_table.add_row(row![r =>
            window.field.map_or_else(|| "all".into(), |field| field.to_string()),
            window.pol,
            window.spw.map_or_else(|| "all".into(), |spw| spw.to_string()),
            format!("{:.4}", window.stats.median),
            format!("{:.4}", window.stats.mad),
            window.newly_flagged
        ]);
    }
    window_table
}

/// A table of how many samples each kind of deterministic flag added.
fn det_flag_table(stats: &DetFlagStats) -> Table {
    let mut reason_table = table!(["reason", "flagged"]);
    reason_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for count in &stats.counts {
        reason_table.add_row(row![count.reason, r -> count.newly_flagged]);
    }
    reason_table
}

fn ms_arg() -> clap::Arg<'static> {
    arg!(<MS> "Measurement set to process").value_hint(ValueHint::DirPath)
}

fn config_arg() -> clap::Arg<'static> {
    arg!(-c --config <PATH> "YAML config file, overridden by other options")
        .required(false)
        .value_hint(ValueHint::FilePath)
}

fn data_column_arg() -> clap::Arg<'static> {
    arg!(--"data-column" <COLUMN> "Visibility column to read")
        .required(false)
        .possible_values(DataColumn::ALL.iter().map(DataColumn::as_str))
}

impl VlaFlagContext {
    fn get_matches<I, T>(args: I) -> Result<ArgMatches, VlaFlagError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let mut app = command!()
            .arg_required_else_help(true)
            .subcommand_required(true)
            .next_line_help(false)
            .about("Flag radio frequency interference in Very Large Array measurement sets.")
            .args(&[
                arg!(--"dry-run" "Just print the summary and exit").global(true),
                arg!(--"no-draw-progress" "do not show progress bars").global(true),
            ])
            .subcommand(
                Command::new("zscore")
                    .about("Compute and cache the modified Z-score of each scan")
                    .args(&[
                        ms_arg(),
                        data_column_arg(),
                        arg!(--"no-mask" "Include flagged samples in the statistics"),
                        arg!(--overwrite "Recompute an existing Z-score cache"),
                        config_arg(),
                    ]),
            )
            .subcommand(
                Command::new("zclip")
                    .about("Flag where the cached modified Z-score exceeds a threshold")
                    .args(&[
                        ms_arg(),
                        arg!(--nsig <THRESHOLD> "Flag where |z| exceeds this, 1e6 disables")
                            .required(false),
                        data_column_arg(),
                        arg!(--"flag-cmds" <PATH> "Also write CASA flag commands to <PATH>")
                            .required(false)
                            .value_hint(ValueHint::FilePath),
                        arg!(--coalesce "Merge overlapping ranges of each channel"),
                        arg!(--"no-apply" "Do not modify the measurement set"),
                        config_arg(),
                    ]),
            )
            .subcommand(
                Command::new("madclip")
                    .about("Flag amplitudes far from the median in units of MAD")
                    .args(&[
                        ms_arg(),
                        arg!(--nsig <NSIG> "Clip beyond this many MADs").required(false),
                        data_column_arg(),
                        arg!(--"no-per-spw" "Clip all spectral windows together"),
                        arg!(--fields <FIELDS> "Only clip these fields, comma separated names or ids")
                            .required(false),
                        config_arg(),
                    ]),
            )
            .subcommand(
                Command::new("detflags")
                    .about("Flag zeros, scan starts, spectral window edges and manual selections")
                    .args(&[
                        ms_arg(),
                        arg!(--quack <SECONDS> "Flag this long at the start of each scan")
                            .required(false),
                        arg!(--"edge-chans" <N> "Flag N channels at each edge of every spw")
                            .required(false),
                        arg!(--"no-clip-zeros" "Do not flag visibilities which are exactly zero"),
                        data_column_arg(),
                        config_arg(),
                    ]),
            );
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    fn parse_value<T>(
        matches: &ArgMatches,
        name: &str,
        option: &str,
        expected: &str,
    ) -> Result<Option<T>, VlaFlagError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match matches.value_of_t::<T>(name) {
            Ok(value) => Ok(Some(value)),
            Err(err) => match err.kind() {
                ArgumentNotFound { .. } => Ok(None),
                _ => Err(InvalidCommandLineArgument {
                    option: option.into(),
                    expected: expected.into(),
                    received: matches.value_of(name).unwrap_or_default().into(),
                }
                .into()),
            },
        }
    }

    fn parse_nsig(matches: &ArgMatches, option: &str) -> Result<Option<f64>, VlaFlagError> {
        Self::parse_value(matches, "nsig", option, "a number")
    }

    fn parse_config(matches: &ArgMatches) -> Result<PipelineConfig, VlaFlagError> {
        let mut config = match matches.value_of("config") {
            Some(path) => PipelineConfig::from_file(path.as_ref())?,
            None => PipelineConfig::default(),
        };
        if let Some(data_column) = matches.value_of("data-column") {
            config.zscore.data_column =
                data_column
                    .parse()
                    .map_err(|_| InvalidCommandLineArgument {
                        option: "--data-column <COLUMN>".into(),
                        expected: DataColumn::ALL.iter().join(", "),
                        received: data_column.into(),
                    })?;
        }
        Ok(config)
    }

    /// Parse the command line into a context, reading the config file if one
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns [`VlaFlagError::ClapError`] for unparseable arguments,
    /// [`VlaFlagError::CLIError`] for bad values,
    /// [`VlaFlagError::ConfigError`] for an unusable config and
    /// [`VlaFlagError::DryRun`] if `--dry-run` was given.
    pub fn from_args<I, T>(args: I) -> Result<Self, VlaFlagError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let (name, sub_matches) = match matches.subcommand() {
            Some(subcommand) => subcommand,
            None => unreachable!("subcommand is required, enforced by clap"),
        };
        let ms_path: PathBuf = match sub_matches.value_of("MS") {
            Some(path) => path.into(),
            None => unreachable!("<MS> is required, enforced by clap"),
        };
        let mut config = Self::parse_config(sub_matches)?;
        let task = match name {
            "zscore" => {
                config.zscore.masked &= !sub_matches.is_present("no-mask");
                config.zscore.overwrite |= sub_matches.is_present("overwrite");
                Task::ZScore
            }
            "zclip" => {
                if let Some(threshold) = Self::parse_nsig(sub_matches, "--nsig <THRESHOLD>")? {
                    config.zscore.threshold = threshold;
                }
                config.zscore.coalesce |= sub_matches.is_present("coalesce");
                Task::ZClip(FlagOutputArgs {
                    flag_cmds: sub_matches.value_of("flag-cmds").map(Into::into),
                    no_apply: sub_matches.is_present("no-apply"),
                })
            }
            "madclip" => {
                if let Some(nsig) = Self::parse_nsig(sub_matches, "--nsig <NSIG>")? {
                    config.madclip.nsig = nsig;
                }
                config.madclip.per_spw &= !sub_matches.is_present("no-per-spw");
                if let Some(fields) = sub_matches.value_of("fields") {
                    config.madclip.fields = Some(
                        fields
                            .split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty())
                            .map(String::from)
                            .collect(),
                    );
                }
                Task::MadClip
            }
            "detflags" => {
                let detflags = &mut config.detflags;
                if let Some(quack_s) =
                    Self::parse_value(sub_matches, "quack", "--quack <SECONDS>", "a number")?
                {
                    detflags.quack_s = quack_s;
                }
                if let Some(edge_chans) = Self::parse_value(
                    sub_matches,
                    "edge-chans",
                    "--edge-chans <N>",
                    "a whole number",
                )? {
                    detflags.edge_chans = edge_chans;
                }
                detflags.clip_zeros &= !sub_matches.is_present("no-clip-zeros");
                Task::DetFlags
            }
            _ => unreachable!("unknown subcommand {name}, enforced by clap"),
        };
        config.validate()?;

        let is_present =
            |option: &str| matches.is_present(option) || sub_matches.is_present(option);
        let result = Self {
            ms_path,
            task,
            config,
            draw_progress: !is_present("no-draw-progress"),
        };

        info!("{}", &result);

        if is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// Run the subcommand against the measurement set.
    ///
    /// # Errors
    ///
    /// Propagates read, compute, cache and write errors.
    pub fn run(self) -> Result<(), VlaFlagError> {
        let VlaFlagContext {
            ms_path,
            task,
            config,
            draw_progress,
        } = self;

        match task {
            Task::ZScore => {
                let (cache_path, zscore) =
                    compute_zscore_with(&ms_path, &config.zscore, draw_progress)?;
                info!(
                    "modified Z-score of shape {:?} cached in {}",
                    zscore.zscore.dim(),
                    cache_path.display()
                );
            }
            Task::ZClip(output) => {
                let output = FlagOutput {
                    flag_cmds: output.flag_cmds,
                    no_apply: output.no_apply,
                };
                let ranges = flag_from_zscore_with(&ms_path, &config.zscore, &output, draw_progress)?;
                if !ranges.is_empty() {
                    info!(
                        "flag ranges per spectral window:\n{}",
                        flag_range_table(&ranges)
                    );
                }
            }
            Task::MadClip => {
                let clip_stats = mad_clip_ms(
                    &ms_path,
                    config.zscore.data_column,
                    &config.madclip,
                    false,
                    draw_progress,
                )?;
                info!(
                    "MAD clip flagged {} new samples:\n{}",
                    clip_stats.newly_flagged(),
                    clip_table(&clip_stats)
                );
            }
            Task::DetFlags => {
                let stats = det_flags_ms(
                    &ms_path,
                    config.zscore.data_column,
                    &config.detflags,
                    false,
                    draw_progress,
                )?;
                info!(
                    "deterministic flags added {} samples:\n{}",
                    stats.newly_flagged(),
                    det_flag_table(&stats)
                );
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod argparse_tests {
    use super::*;
    use crate::{config::ConfigError, io::ms::tests::write_test_ms};
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn test_ms() -> (tempfile::TempDir, String) {
        let tmp_dir = tempdir().unwrap();
        let ms = tmp_dir.path().join("test.ms");
        write_test_ms(&ms);
        let ms = ms.to_str().unwrap().to_string();
        (tmp_dir, ms)
    }

    #[test]
    fn test_parse_missing_ms() {
        match VlaFlagContext::from_args(&["vlaflag", "zscore"]) {
            Err(VlaFlagError::ClapError(inner)) => assert!(matches!(
                inner.kind(),
                clap::error::ErrorKind::MissingRequiredArgument { .. }
            )),
            Err(e) => panic!("expected missing required argument error, not {}", e),
            Ok(_) => panic!("expected error, but got Ok(_)"),
        }
    }

    #[test]
    fn test_parse_unknown_subcommand() {
        assert!(matches!(
            VlaFlagContext::from_args(&["vlaflag", "aoflag", "test.ms"]),
            Err(VlaFlagError::ClapError(_))
        ));
    }

    #[test]
    fn test_parse_invalid_data_column() {
        let (_tmp_dir, ms) = test_ms();
        match VlaFlagContext::from_args(&["vlaflag", "zscore", ms.as_str(), "--data-column", "weird"]) {
            Err(VlaFlagError::ClapError(inner)) => assert!(matches!(
                inner.kind(),
                clap::error::ErrorKind::InvalidValue { .. }
            )),
            Err(e) => panic!("expected invalid value error, not {}", e),
            Ok(_) => panic!("expected error, but got Ok(_)"),
        }
    }

    #[test]
    fn test_parse_invalid_nsig() {
        let (_tmp_dir, ms) = test_ms();
        assert!(matches!(
            VlaFlagContext::from_args(&["vlaflag", "madclip", ms.as_str(), "--nsig", "lots"]),
            Err(VlaFlagError::CLIError(InvalidCommandLineArgument { .. }))
        ));
        assert!(matches!(
            VlaFlagContext::from_args(&["vlaflag", "zclip", ms.as_str(), "--nsig", "0"]),
            Err(VlaFlagError::ConfigError(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_parse_valid_zscore() {
        let (_tmp_dir, ms) = test_ms();
        #[rustfmt::skip]
        let args = vec![
            "vlaflag", "zscore", ms.as_str(),
            "--data-column", "residual",
            "--no-mask",
            "--overwrite",
        ];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(ctx.task, Task::ZScore);
        assert_eq!(ctx.config.zscore.data_column, DataColumn::Residual);
        assert!(!ctx.config.zscore.masked);
        assert!(ctx.config.zscore.overwrite);
        assert!(ctx.draw_progress);
    }

    #[test]
    fn test_parse_valid_madclip() {
        let (_tmp_dir, ms) = test_ms();
        #[rustfmt::skip]
        let args = vec!["vlaflag", "madclip", ms.as_str(), "--nsig", "2.5", "--no-per-spw"];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(ctx.task, Task::MadClip);
        assert_eq!(ctx.config.madclip.nsig, 2.5);
        assert!(!ctx.config.madclip.per_spw);
    }

    #[test]
    fn test_parse_madclip_fields() {
        let (_tmp_dir, ms) = test_ms();
        #[rustfmt::skip]
        let args = vec!["vlaflag", "madclip", ms.as_str(), "--fields", "3C286, 1"];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(
            ctx.config.madclip.fields,
            Some(vec!["3C286".to_string(), "1".to_string()])
        );
        assert!(format!("{ctx}").contains("Fields:               3C286, 1"));

        let args = vec!["vlaflag", "madclip", ms.as_str(), "--fields", ","];
        assert!(matches!(
            VlaFlagContext::from_args(&args),
            Err(VlaFlagError::ConfigError(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_parse_valid_detflags() {
        let (_tmp_dir, ms) = test_ms();
        #[rustfmt::skip]
        let args = vec![
            "vlaflag", "detflags", ms.as_str(),
            "--quack", "10",
            "--edge-chans", "1",
            "--no-clip-zeros",
        ];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(ctx.task, Task::DetFlags);
        assert_eq!(ctx.config.detflags.quack_s, 10.0);
        assert_eq!(ctx.config.detflags.edge_chans, 1);
        assert!(!ctx.config.detflags.clip_zeros);
        assert!(format!("{ctx}").contains("Edge channels:        1"));

        let args = vec!["vlaflag", "detflags", ms.as_str(), "--edge-chans", "1.5"];
        assert!(matches!(
            VlaFlagContext::from_args(&args),
            Err(VlaFlagError::CLIError(InvalidCommandLineArgument { .. }))
        ));
        let args = vec!["vlaflag", "detflags", ms.as_str(), "--quack", "nan"];
        assert!(matches!(
            VlaFlagContext::from_args(&args),
            Err(VlaFlagError::ConfigError(ConfigError::Invalid { .. }))
        ));
    }

    #[test]
    fn test_parse_config_overridden_by_args() {
        let (_tmp_dir, ms) = test_ms();
        let mut config = NamedTempFile::new().unwrap();
        writeln!(
            config,
            "zscore:\n  data_column: model\n  threshold: 7.0\n  coalesce: true\nmadclip:\n  nsig: 3.0"
        )
        .unwrap();
        let config_path = config.path().to_str().unwrap();

        let args = vec!["vlaflag", "zclip", ms.as_str(), "--config", config_path];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(ctx.config.zscore.data_column, DataColumn::Model);
        assert_eq!(ctx.config.zscore.threshold, 7.0);
        assert!(ctx.config.zscore.coalesce);

        #[rustfmt::skip]
        let args = vec!["vlaflag", "zclip", ms.as_str(), "--config", config_path, "--nsig", "4"];
        let ctx = VlaFlagContext::from_args(&args).unwrap();
        assert_eq!(ctx.config.zscore.threshold, 4.0);
        assert_eq!(ctx.config.madclip.nsig, 3.0);
    }

    #[test]
    fn test_parse_bad_config() {
        let (_tmp_dir, ms) = test_ms();
        let mut config = NamedTempFile::new().unwrap();
        writeln!(config, "zscore:\n  treshold: 7.0").unwrap();
        let args = vec!["vlaflag", "zclip", ms.as_str(), "-c", config.path().to_str().unwrap()];
        assert!(matches!(
            VlaFlagContext::from_args(&args),
            Err(VlaFlagError::ConfigError(ConfigError::Yaml(_)))
        ));
    }

    #[test]
    fn test_parse_dry_run() {
        let (_tmp_dir, ms) = test_ms();
        assert!(matches!(
            VlaFlagContext::from_args(&["vlaflag", "zscore", ms.as_str(), "--dry-run"]),
            Err(DryRun {})
        ));
        assert!(matches!(
            VlaFlagContext::from_args(&["vlaflag", "--dry-run", "madclip", ms.as_str()]),
            Err(DryRun {})
        ));
    }
}
