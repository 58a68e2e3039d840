//! Visibility and flag cubes, and the traits used to read and flag them.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{
    flag_ranges::FlagRange,
    io::error::IOError,
    marlu::{c32, hifitime::Epoch},
    ndarray::{Array4, Axis},
    segments::ScanSegmentation,
    zscore::ZScoreError,
};

/// Which visibilities to read from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataColumn {
    /// The raw visibilities (`DATA`)
    Data,
    /// Calibrated visibilities (`CORRECTED_DATA`)
    #[default]
    Corrected,
    /// Model visibilities (`MODEL_DATA`)
    Model,
    /// Calibrated minus model visibilities
    Residual,
}

impl DataColumn {
    /// All the variants, in the order they are usually listed.
    pub const ALL: [DataColumn; 4] = [
        DataColumn::Data,
        DataColumn::Corrected,
        DataColumn::Model,
        DataColumn::Residual,
    ];

    /// The lower case identifier, as used in cache file names and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataColumn::Data => "data",
            DataColumn::Corrected => "corrected",
            DataColumn::Model => "model",
            DataColumn::Residual => "residual",
        }
    }

    /// The measurement set columns which are combined to form this data.
    /// The second column, if any, is subtracted from the first.
    pub fn ms_columns(&self) -> (&'static str, Option<&'static str>) {
        match self {
            DataColumn::Data => ("DATA", None),
            DataColumn::Corrected => ("CORRECTED_DATA", None),
            DataColumn::Model => ("MODEL_DATA", None),
            DataColumn::Residual => ("CORRECTED_DATA", Some("MODEL_DATA")),
        }
    }
}

impl Display for DataColumn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        DataColumn::ALL
            .into_iter()
            .find(|col| {
                col.as_str() == lower || col.ms_columns() == (s.to_uppercase().as_str(), None)
            })
            .ok_or_else(|| {
                format!(
                    "unknown data column {s:?}, expected one of {}",
                    DataColumn::ALL.map(|col| col.as_str()).join(", ")
                )
            })
    }
}

/// Visibilities and flags for one dataset, with the metadata needed to turn
/// array indices back into times and channels.
///
/// Both cubes are indexed `(polarization, baseline, time, frequency)`.
#[derive(Debug, Clone)]
pub struct VisCube {
    /// Complex visibilities
    pub vis: Array4<c32>,
    /// `true` where a visibility is excluded from statistics
    pub flags: Array4<bool>,
    /// Centre frequency of each channel [Hz], flattened over spectral windows
    pub freqs_hz: Vec<f64>,
    /// The number of channels in every spectral window
    pub chans_per_spw: usize,
    /// Integration time [s]
    pub integration_time_s: f64,
    /// Centroid of each integration, ascending
    pub timestamps: Vec<Epoch>,
    /// Antenna indices of each baseline
    pub ant_pairs: Vec<(usize, usize)>,
    /// Scan lengths, when known
    pub scans: Option<ScanSegmentation>,
    /// The field observed at each timestep, when known
    pub field_ids: Option<Vec<usize>>,
}

impl VisCube {
    /// Check the cubes and the metadata all agree on their dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError::ShapeMismatch`] describing the first disagreement.
    pub fn validate(&self) -> Result<(), ZScoreError> {
        trace!("start VisCube::validate");
        let vis_dim = self.vis.dim();
        let (_, num_baselines, num_times, num_freqs) = vis_dim;
        let checks = [
            ("flags", format!("{:?}", self.flags.dim()), self.flags.dim() == vis_dim),
            (
                "freqs_hz",
                self.freqs_hz.len().to_string(),
                self.freqs_hz.len() == num_freqs,
            ),
            (
                "timestamps",
                self.timestamps.len().to_string(),
                self.timestamps.len() == num_times,
            ),
            (
                "ant_pairs",
                self.ant_pairs.len().to_string(),
                self.ant_pairs.len() == num_baselines,
            ),
            (
                "chans_per_spw",
                self.chans_per_spw.to_string(),
                self.chans_per_spw > 0 && num_freqs % self.chans_per_spw == 0,
            ),
        ];
        for (name, found, ok) in checks {
            if !ok {
                return Err(ZScoreError::ShapeMismatch {
                    name: name.to_string(),
                    expected: format!("consistent with visibilities {vis_dim:?}"),
                    found,
                });
            }
        }
        if let Some(scans) = &self.scans {
            scans.validate(num_times)?;
        }
        if let Some(field_ids) = &self.field_ids {
            if field_ids.len() != num_times {
                return Err(ZScoreError::ShapeMismatch {
                    name: "field_ids".into(),
                    expected: format!("{num_times} timesteps"),
                    found: field_ids.len().to_string(),
                });
            }
        }
        trace!("end VisCube::validate");
        Ok(())
    }

    /// The number of timesteps.
    pub fn num_timesteps(&self) -> usize {
        self.vis.len_of(Axis(2))
    }

    /// The number of frequency channels across all spectral windows.
    pub fn num_freqs(&self) -> usize {
        self.vis.len_of(Axis(3))
    }

    /// The number of spectral windows.
    pub fn num_spws(&self) -> usize {
        self.num_freqs() / self.chans_per_spw.max(1)
    }

    /// The timesteps of each field, in field order. Without field ids, every
    /// timestep belongs to one field, `None`.
    pub fn timesteps_by_field(&self) -> BTreeMap<Option<usize>, Vec<usize>> {
        let mut by_field: BTreeMap<Option<usize>, Vec<usize>> = BTreeMap::new();
        for t in 0..self.num_timesteps() {
            let field = self
                .field_ids
                .as_ref()
                .and_then(|field_ids| field_ids.get(t).copied());
            by_field.entry(field).or_default().push(t);
        }
        by_field
    }

    /// The fraction of samples which are flagged.
    pub fn flagged_fraction(&self) -> f64 {
        if self.flags.is_empty() {
            return 0.0;
        }
        self.flags.iter().filter(|&&f| f).count() as f64 / self.flags.len() as f64
    }
}

/// Storage which can provide a [`VisCube`].
pub trait VisReader {
    /// Read visibilities from `data_column`, with their flags and metadata.
    ///
    /// # Errors
    ///
    /// Propagates any [`IOError`] from the underlying storage unchanged.
    fn read_vis(&self, data_column: DataColumn) -> Result<VisCube, IOError>;

    /// A human readable identifier for the dataset, used in logs and cache metadata.
    fn identity(&self) -> String;
}

/// Storage which accepts new flags. Flags are only ever added, never cleared.
pub trait FlagWriter {
    /// Flag every polarization and baseline within each range.
    ///
    /// # Errors
    ///
    /// Propagates any [`IOError`] from the underlying storage unchanged.
    fn write_flag_ranges(&mut self, ranges: &[FlagRange]) -> Result<(), IOError>;

    /// Merge the flags of `cube` into storage.
    ///
    /// # Errors
    ///
    /// Propagates any [`IOError`] from the underlying storage unchanged.
    fn write_flag_cube(&mut self, cube: &VisCube) -> Result<(), IOError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_common::synthetic_cube;

    #[test]
    fn test_data_column_parse() {
        assert_eq!("corrected".parse::<DataColumn>(), Ok(DataColumn::Corrected));
        assert_eq!("RESIDUAL".parse::<DataColumn>(), Ok(DataColumn::Residual));
        assert_eq!("MODEL_DATA".parse::<DataColumn>(), Ok(DataColumn::Model));
        assert_eq!("DATA".parse::<DataColumn>(), Ok(DataColumn::Data));
        assert!("weights".parse::<DataColumn>().is_err());
    }

    #[test]
    fn test_residual_subtracts_model() {
        assert_eq!(
            DataColumn::Residual.ms_columns(),
            ("CORRECTED_DATA", Some("MODEL_DATA"))
        );
    }

    #[test]
    fn test_validate_catches_timestamp_mismatch() {
        let mut cube = synthetic_cube(2, 3, 8, 16, 8);
        assert!(cube.validate().is_ok());
        cube.timestamps.pop();
        assert!(matches!(
            cube.validate(),
            Err(ZScoreError::ShapeMismatch { name, .. }) if name == "timestamps"
        ));
    }

    #[test]
    fn test_timesteps_by_field() {
        let mut cube = synthetic_cube(1, 2, 6, 4, 4);
        assert_eq!(
            cube.timesteps_by_field().into_iter().collect::<Vec<_>>(),
            vec![(None, vec![0, 1, 2, 3, 4, 5])]
        );

        cube.field_ids = Some(vec![1, 1, 0, 0, 1, 1]);
        assert!(cube.validate().is_ok());
        let by_field = cube.timesteps_by_field();
        assert_eq!(by_field[&Some(0)], vec![2, 3]);
        assert_eq!(by_field[&Some(1)], vec![0, 1, 4, 5]);

        cube.field_ids = Some(vec![0; 5]);
        assert!(matches!(
            cube.validate(),
            Err(ZScoreError::ShapeMismatch { name, .. }) if name == "field_ids"
        ));
    }

    #[test]
    fn test_validate_catches_bad_scans() {
        let mut cube = synthetic_cube(2, 3, 8, 16, 8);
        cube.scans = Some(ScanSegmentation::new(vec![4, 3]).unwrap());
        assert!(matches!(
            cube.validate(),
            Err(ZScoreError::BadSegmentation { .. })
        ));
    }
}
