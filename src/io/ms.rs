// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read visibilities from, and write flags to, CASA measurement sets.
//!
//! More info: <https://casa.nrao.edu/Memos/229.html#SECTION00060000000000000000>
//!
//! Only the parallel hand correlations (RR/LL or XX/YY) are read, and
//! auto-correlations are skipped. Spectral windows are stacked along a single
//! frequency axis, so they must all have the same number of channels.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use log::{debug, info, trace, warn};

use crate::{
    constants::{CASACORE_TIME_OFFSET_S, PARALLEL_HAND_CORR_TYPES},
    flag_ranges::FlagRange,
    io::error::IOError,
    marlu::{
        c32,
        hifitime::Epoch,
        rubbl_casatables::{Table, TableOpenMode},
    },
    ndarray::{Array2, Array4},
    segments::ScanSegmentation,
    util::progress_bar,
    vis::{DataColumn, FlagWriter, VisCube, VisReader},
    zscore::ZScoreCube,
};

/// Open a measurement set table. If `table` is `None`, open the main table.
fn open_table(ms: &Path, table: Option<&str>, mode: TableOpenMode) -> Result<Table, IOError> {
    let path = match table {
        Some(table) => ms.join(table),
        None => ms.to_path_buf(),
    };
    Ok(Table::open(path, mode)?)
}

/// Where one row of the main table lands in a [`VisCube`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowIndex {
    time_idx: usize,
    /// `None` for auto-correlations
    baseline_idx: Option<usize>,
    spw: usize,
    pol_id: usize,
}

/// Everything about a measurement set needed to place its rows, read once.
#[derive(Debug, Clone)]
struct MsLayout {
    rows: Vec<RowIndex>,
    timestamps: Vec<Epoch>,
    ant_pairs: Vec<(usize, usize)>,
    scans: ScanSegmentation,
    /// FIELD_ID of the first row of each timestep
    time_fields: Vec<usize>,
    field_names: Vec<String>,
    freqs_hz: Vec<f64>,
    chans_per_spw: usize,
    integration_time_s: f64,
    /// For each POLARIZATION row, the indices of the parallel hand correlations
    parallel_hands: Vec<Vec<usize>>,
}

impl MsLayout {
    fn num_pols(&self) -> usize {
        self.parallel_hands.first().map_or(0, Vec::len)
    }

    fn dim(&self) -> (usize, usize, usize, usize) {
        (
            self.num_pols(),
            self.ant_pairs.len(),
            self.timestamps.len(),
            self.freqs_hz.len(),
        )
    }
}

/// Indices of the parallel hand correlations within `corr_types`.
fn parallel_hand_indices(corr_types: &[i32]) -> Vec<usize> {
    corr_types
        .iter()
        .enumerate()
        .filter(|(_, corr_type)| PARALLEL_HAND_CORR_TYPES.contains(corr_type))
        .map(|(idx, _)| idx)
        .collect()
}

fn read_spectral_windows(ms: &Path) -> Result<(Vec<f64>, usize), IOError> {
    let mut spw_table = open_table(ms, Some("SPECTRAL_WINDOW"), TableOpenMode::Read)?;
    let mut freqs_hz = vec![];
    let mut chans_per_spw = 0;
    for spw in 0..spw_table.n_rows() {
        let chan_freqs: Vec<f64> = spw_table.get_cell_as_vec("CHAN_FREQ", spw)?;
        if spw == 0 {
            chans_per_spw = chan_freqs.len();
        } else if chan_freqs.len() != chans_per_spw {
            return Err(IOError::UnequalSpectralWindows {
                spw: spw as usize,
                expected: chans_per_spw,
                found: chan_freqs.len(),
            });
        }
        freqs_hz.extend(chan_freqs);
    }
    if chans_per_spw == 0 {
        return Err(IOError::MsInconsistent {
            table: "SPECTRAL_WINDOW".into(),
            expected: "at least one channel".into(),
            found: "none".into(),
        });
    }
    Ok((freqs_hz, chans_per_spw))
}

fn read_parallel_hands(ms: &Path) -> Result<Vec<Vec<usize>>, IOError> {
    let mut pol_table = open_table(ms, Some("POLARIZATION"), TableOpenMode::Read)?;
    let mut parallel_hands = vec![];
    for row in 0..pol_table.n_rows() {
        let corr_types: Vec<i32> = pol_table.get_cell_as_vec("CORR_TYPE", row)?;
        let indices = parallel_hand_indices(&corr_types);
        if indices.is_empty() {
            return Err(IOError::NoParallelHands { found: corr_types });
        }
        if let Some(first) = parallel_hands.first().map(Vec::len) {
            if indices.len() != first {
                return Err(IOError::MsInconsistent {
                    table: "POLARIZATION".into(),
                    expected: format!("{first} parallel hands"),
                    found: format!("{} in row {row}", indices.len()),
                });
            }
        }
        parallel_hands.push(indices);
    }
    if parallel_hands.is_empty() {
        return Err(IOError::NoParallelHands { found: vec![] });
    }
    Ok(parallel_hands)
}

fn as_index(value: i32, table: &str, what: &str, len: usize) -> Result<usize, IOError> {
    match usize::try_from(value) {
        Ok(idx) if idx < len => Ok(idx),
        _ => Err(IOError::MsInconsistent {
            table: table.into(),
            expected: format!("{what} in 0..{len}"),
            found: value.to_string(),
        }),
    }
}

fn read_layout(ms: &Path) -> Result<MsLayout, IOError> {
    trace!("start read_layout");
    let (freqs_hz, chans_per_spw) = read_spectral_windows(ms)?;
    let num_spws = freqs_hz.len() / chans_per_spw;
    let parallel_hands = read_parallel_hands(ms)?;
    let mut field_table = open_table(ms, Some("FIELD"), TableOpenMode::Read)?;
    let field_names: Vec<String> = field_table.get_col_as_vec("NAME")?;

    let mut ddid_table = open_table(ms, Some("DATA_DESCRIPTION"), TableOpenMode::Read)?;
    let ddid_spws: Vec<i32> = ddid_table.get_col_as_vec("SPECTRAL_WINDOW_ID")?;
    let ddid_pols: Vec<i32> = ddid_table.get_col_as_vec("POLARIZATION_ID")?;
    let ddids = ddid_spws
        .iter()
        .zip(ddid_pols.iter())
        .map(|(&spw, &pol)| {
            Ok((
                as_index(spw, "DATA_DESCRIPTION", "SPECTRAL_WINDOW_ID", num_spws)?,
                as_index(pol, "DATA_DESCRIPTION", "POLARIZATION_ID", parallel_hands.len())?,
            ))
        })
        .collect::<Result<Vec<_>, IOError>>()?;

    let mut main_table = open_table(ms, None, TableOpenMode::Read)?;
    if main_table.n_rows() == 0 {
        return Err(IOError::MainTableEmpty(ms.to_path_buf()));
    }
    let times: Vec<f64> = main_table.get_col_as_vec("TIME")?;
    let ant1: Vec<i32> = main_table.get_col_as_vec("ANTENNA1")?;
    let ant2: Vec<i32> = main_table.get_col_as_vec("ANTENNA2")?;
    let row_ddids: Vec<i32> = main_table.get_col_as_vec("DATA_DESC_ID")?;
    let scan_numbers: Vec<i32> = main_table.get_col_as_vec("SCAN_NUMBER")?;
    let row_fields: Vec<i32> = main_table.get_col_as_vec("FIELD_ID")?;
    let integration_time_s: f64 = main_table.get_cell("INTERVAL", 0)?;

    let mut unique_times = times.clone();
    unique_times.sort_by(f64::total_cmp);
    unique_times.dedup();
    let time_idx_of = |time: f64| match unique_times.binary_search_by(|t| t.total_cmp(&time)) {
        Ok(idx) | Err(idx) => idx,
    };

    let mut ant_pairs = BTreeSet::new();
    for (&a1, &a2) in ant1.iter().zip(ant2.iter()) {
        let a1 = as_index(a1, "MAIN", "ANTENNA1", usize::MAX)?;
        let a2 = as_index(a2, "MAIN", "ANTENNA2", usize::MAX)?;
        if a1 != a2 {
            ant_pairs.insert((a1, a2));
        }
    }
    let ant_pairs: Vec<(usize, usize)> = ant_pairs.into_iter().collect();

    let mut time_scans = vec![None; unique_times.len()];
    let mut time_fields = vec![None; unique_times.len()];
    let mut rows = Vec::with_capacity(times.len());
    for (row, &time) in times.iter().enumerate() {
        let time_idx = time_idx_of(time);
        time_scans[time_idx].get_or_insert(scan_numbers[row]);
        if time_fields[time_idx].is_none() {
            time_fields[time_idx] =
                Some(as_index(row_fields[row], "MAIN", "FIELD_ID", field_names.len())?);
        }
        let (spw, pol_id) = ddids[as_index(row_ddids[row], "MAIN", "DATA_DESC_ID", ddids.len())?];
        let pair = (ant1[row] as usize, ant2[row] as usize);
        rows.push(RowIndex {
            time_idx,
            baseline_idx: ant_pairs.binary_search(&pair).ok(),
            spw,
            pol_id,
        });
    }
    let scans = ScanSegmentation::from_scan_numbers(
        &time_scans.into_iter().flatten().collect::<Vec<_>>(),
    )
    .map_err(|err| IOError::MsInconsistent {
        table: "MAIN".into(),
        expected: "SCAN_NUMBER for every timestep".into(),
        found: err.to_string(),
    })?;

    let time_fields = time_fields.into_iter().flatten().collect();

    let timestamps = unique_times
        .iter()
        .map(|&time| Epoch::from_utc_seconds(time - CASACORE_TIME_OFFSET_S))
        .collect();

    trace!("end read_layout");
    Ok(MsLayout {
        rows,
        timestamps,
        ant_pairs,
        scans,
        time_fields,
        field_names,
        freqs_hz,
        chans_per_spw,
        integration_time_s,
        parallel_hands,
    })
}

/// A measurement set on disk, whose main table rows have been indexed.
#[derive(Debug, Clone)]
pub struct MeasurementSetReader {
    path: PathBuf,
    /// The canonical path, which names this measurement set in Z-score caches
    identity: String,
    layout: MsLayout,
    /// Whether to draw progress bars while reading and writing
    pub draw_progress: bool,
}

impl MeasurementSetReader {
    /// Open the measurement set at `path` and index its main table.
    ///
    /// # Errors
    ///
    /// Returns [`IOError::BadFile`] if `path` doesn't exist, or another
    /// [`IOError`] if the tables are missing or inconsistent.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, IOError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(IOError::BadFile(path));
        }
        let identity = path
            .canonicalize()
            .map_or_else(|_| path.display().to_string(), |p| p.display().to_string());
        let layout = read_layout(&path)?;
        debug!(
            "{}: {} rows, shape (pol, baseline, time, freq) {:?}, {} spws, scans {}",
            path.display(),
            layout.rows.len(),
            layout.dim(),
            layout.freqs_hz.len() / layout.chans_per_spw,
            layout.scans
        );
        Ok(Self {
            path,
            identity,
            layout,
            draw_progress: true,
        })
    }

    /// The path to the measurement set.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The scan lengths, in timesteps.
    pub fn scans(&self) -> &ScanSegmentation {
        &self.layout.scans
    }

    /// The NAME of each row of the FIELD table.
    pub fn field_names(&self) -> &[String] {
        &self.layout.field_names
    }

    /// Centroid of each integration, ascending.
    pub fn timestamps(&self) -> &[Epoch] {
        &self.layout.timestamps
    }

    /// Check that `zscore` was computed from this measurement set and that
    /// its time and frequency axes still line up with the main table, so
    /// flag ranges index the right rows.
    ///
    /// # Errors
    ///
    /// Returns [`IOError::ZScoreMismatch`] naming the first disagreement.
    pub fn check_zscore(&self, zscore: &ZScoreCube) -> Result<(), IOError> {
        let mismatch = |what: &str, expected: String, found: String| IOError::ZScoreMismatch {
            ms: self.path.clone(),
            what: what.into(),
            expected,
            found,
        };
        let layout = &self.layout;
        if let Some(source) = &zscore.source {
            if *source != self.identity {
                return Err(mismatch("source", self.identity.clone(), source.clone()));
            }
        }
        if zscore.chans_per_spw != layout.chans_per_spw {
            return Err(mismatch(
                "channels per spw",
                layout.chans_per_spw.to_string(),
                zscore.chans_per_spw.to_string(),
            ));
        }
        let freqs_match = zscore.freqs_hz.len() == layout.freqs_hz.len()
            && zscore
                .freqs_hz
                .iter()
                .zip(&layout.freqs_hz)
                .all(|(a, b)| (a - b).abs() < 1.0);
        if !freqs_match {
            return Err(mismatch(
                "frequencies",
                format!("{} channels", layout.freqs_hz.len()),
                format!("{} channels, or different values", zscore.freqs_hz.len()),
            ));
        }
        let times_match = zscore.timestamps.len() == layout.timestamps.len()
            && zscore
                .timestamps
                .iter()
                .zip(&layout.timestamps)
                .all(|(a, b)| (*a - *b).abs().to_seconds() < 1e-3);
        if !times_match {
            return Err(mismatch(
                "timestamps",
                format!("{} timesteps", layout.timestamps.len()),
                format!("{} timesteps, or different values", zscore.timestamps.len()),
            ));
        }
        Ok(())
    }

    fn check_columns(&self, table: &mut Table, columns: &[&str]) -> Result<(), IOError> {
        let col_names = table.column_names()?;
        for &col in columns {
            if !col_names.iter().any(|name| name == col) {
                return Err(IOError::NoDataCol { col: col.into() });
            }
        }
        Ok(())
    }
}

impl VisReader for MeasurementSetReader {
    fn read_vis(&self, data_column: DataColumn) -> Result<VisCube, IOError> {
        trace!("start MeasurementSetReader::read_vis");
        let layout = &self.layout;
        let (data_col, subtract_col) = data_column.ms_columns();
        let mut main_table = open_table(&self.path, None, TableOpenMode::Read)?;
        let mut needed = vec![data_col, "FLAG"];
        needed.extend(subtract_col);
        self.check_columns(&mut main_table, &needed)?;

        let dim = layout.dim();
        let mut vis = Array4::<c32>::zeros(dim);
        // timesteps and baselines with no rows stay flagged
        let mut flags = Array4::<bool>::from_elem(dim, true);

        let progress = progress_bar(layout.rows.len() as u64, "reading MS", self.draw_progress);
        for (row, index) in layout.rows.iter().enumerate() {
            progress.inc(1);
            let baseline_idx = match index.baseline_idx {
                Some(baseline_idx) => baseline_idx,
                None => continue,
            };
            let row = row as u64;
            let mut row_vis: Array2<c32> = main_table.get_cell(data_col, row)?;
            if let Some(subtract_col) = subtract_col {
                let model: Array2<c32> = main_table.get_cell(subtract_col, row)?;
                row_vis -= &model;
            }
            let row_flags: Array2<bool> = main_table.get_cell("FLAG", row)?;
            if row_vis.nrows() != layout.chans_per_spw || row_flags.dim() != row_vis.dim() {
                return Err(IOError::MsInconsistent {
                    table: "MAIN".into(),
                    expected: format!("{} channels in row {row}", layout.chans_per_spw),
                    found: format!("{data_col} {:?}, FLAG {:?}", row_vis.dim(), row_flags.dim()),
                });
            }
            let freq_offset = index.spw * layout.chans_per_spw;
            for (pol_idx, &corr_idx) in layout.parallel_hands[index.pol_id].iter().enumerate() {
                for chan in 0..layout.chans_per_spw {
                    let out = [pol_idx, baseline_idx, index.time_idx, freq_offset + chan];
                    vis[out] = row_vis[[chan, corr_idx]];
                    flags[out] = row_flags[[chan, corr_idx]];
                }
            }
        }
        progress.finish();

        let cube = VisCube {
            vis,
            flags,
            freqs_hz: layout.freqs_hz.clone(),
            chans_per_spw: layout.chans_per_spw,
            integration_time_s: layout.integration_time_s,
            timestamps: layout.timestamps.clone(),
            ant_pairs: layout.ant_pairs.clone(),
            scans: Some(layout.scans.clone()),
            field_ids: Some(layout.time_fields.clone()),
        };
        info!(
            "read {} from {}: {:.2}% flagged",
            data_column,
            self.path.display(),
            100.0 * cube.flagged_fraction()
        );
        trace!("end MeasurementSetReader::read_vis");
        Ok(cube)
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }
}

impl FlagWriter for MeasurementSetReader {
    fn write_flag_ranges(&mut self, ranges: &[FlagRange]) -> Result<(), IOError> {
        trace!("start MeasurementSetReader::write_flag_ranges");
        if ranges.is_empty() {
            warn!("no flag ranges to write to {}", self.path.display());
            return Ok(());
        }
        // channels to flag for each (spw, timestep)
        let mut chans_by_row: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for range in ranges {
            for time_idx in range.start_idx..=range.end_idx {
                chans_by_row
                    .entry((range.spw, time_idx))
                    .or_default()
                    .push(range.channel);
            }
        }
        let mut main_table = open_table(&self.path, None, TableOpenMode::ReadWrite)?;
        let progress = progress_bar(
            self.layout.rows.len() as u64,
            "writing flags",
            self.draw_progress,
        );
        let mut rows_changed = 0;
        for (row, index) in self.layout.rows.iter().enumerate() {
            progress.inc(1);
            let channels = match chans_by_row.get(&(index.spw, index.time_idx)) {
                Some(channels) => channels,
                None => continue,
            };
            let row = row as u64;
            let mut row_flags: Array2<bool> = main_table.get_cell("FLAG", row)?;
            for &channel in channels {
                if channel < row_flags.nrows() {
                    row_flags.row_mut(channel).fill(true);
                }
            }
            main_table.put_cell("FLAG", row, &row_flags)?;
            rows_changed += 1;
        }
        progress.finish();
        info!(
            "applied {} flag ranges to {} rows of {}",
            ranges.len(),
            rows_changed,
            self.path.display()
        );
        Ok(())
    }

    fn write_flag_cube(&mut self, cube: &VisCube) -> Result<(), IOError> {
        trace!("start MeasurementSetReader::write_flag_cube");
        let layout = &self.layout;
        if cube.flags.dim() != layout.dim() {
            return Err(IOError::MsInconsistent {
                table: "MAIN".into(),
                expected: format!("flags of shape {:?}", layout.dim()),
                found: format!("{:?}", cube.flags.dim()),
            });
        }
        let mut main_table = open_table(&self.path, None, TableOpenMode::ReadWrite)?;
        let progress = progress_bar(layout.rows.len() as u64, "writing flags", self.draw_progress);
        let mut rows_changed = 0;
        for (row, index) in layout.rows.iter().enumerate() {
            progress.inc(1);
            let baseline_idx = match index.baseline_idx {
                Some(baseline_idx) => baseline_idx,
                None => continue,
            };
            let row = row as u64;
            let mut row_flags: Array2<bool> = main_table.get_cell("FLAG", row)?;
            let freq_offset = index.spw * layout.chans_per_spw;
            let mut changed = false;
            for (pol_idx, &corr_idx) in layout.parallel_hands[index.pol_id].iter().enumerate() {
                for chan in 0..row_flags.nrows().min(layout.chans_per_spw) {
                    let flagged =
                        cube.flags[[pol_idx, baseline_idx, index.time_idx, freq_offset + chan]];
                    if flagged && !row_flags[[chan, corr_idx]] {
                        row_flags[[chan, corr_idx]] = true;
                        changed = true;
                    }
                }
            }
            if changed {
                main_table.put_cell("FLAG", row, &row_flags)?;
                rows_changed += 1;
            }
        }
        progress.finish();
        info!(
            "merged flags into {} rows of {}",
            rows_changed,
            self.path.display()
        );
        Ok(())
    }
}
