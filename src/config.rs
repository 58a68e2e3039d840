//! Pipeline configuration, read from YAML.
//!
//! ```yaml
//! zscore:
//!   data_column: corrected  # data | corrected | model | residual
//!   masked: true
//!   overwrite: false
//!   threshold: 5.0          # >= 1e6 disables flagging
//!   output_dir: output
//!   coalesce: false
//! madclip:
//!   nsig: 4.0
//!   per_spw: true
//!   fields: [J1407+2827]    # names or ids, all fields if omitted
//! detflags:
//!   clip_zeros: true
//!   quack_s: 10.0           # seconds at the start of each scan
//!   edge_chans: 3           # channels at each edge of every spw
//!   manual:
//!     - reason: ea05 pointing
//!       antennas: [4]
//!       timerange: 2019/03/01/10:00:00~2019/03/01/10:30:00
//!     - reason: satellite band
//!       spw: 2:10~20,3
//! ```
//!
//! Every field is optional. Unknown fields are rejected.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    constants::{DEFAULT_MADCLIP_NSIG, DEFAULT_OUTPUT_DIR, DEFAULT_ZSCORE_THRESHOLD},
    detflags::FlagSelection,
    vis::DataColumn,
    zscore::{ZScoreContext, ZScoreContextBuilder},
};

#[derive(Error, Debug)]
/// Errors reading or validating a configuration
pub enum ConfigError {
    #[error("Couldn't read config file {path}: {source}")]
    /// The file couldn't be opened
    Read {
        /// The config file
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    #[error("Couldn't parse config: {0}")]
    /// The YAML was malformed, or had unknown or mistyped fields
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid config value {field}={value}: {reason}")]
    /// A value parsed, but isn't usable
    Invalid {
        /// The offending field
        field: String,
        /// Its value
        value: String,
        /// What a valid value looks like
        reason: String,
    },
}

/// Options for computing the modified Z-score and flagging from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZScoreConfig {
    /// Which visibilities to compute the Z-score of
    pub data_column: DataColumn,
    /// Exclude flagged visibilities from the statistics
    pub masked: bool,
    /// Recompute even if a cache exists
    pub overwrite: bool,
    /// Flag where `|z|` exceeds this
    pub threshold: f64,
    /// Cache directory, relative to the parent of the measurement set
    pub output_dir: String,
    /// Merge touching flag ranges before writing flag commands
    pub coalesce: bool,
}

impl Default for ZScoreConfig {
    fn default() -> Self {
        Self {
            data_column: DataColumn::default(),
            masked: true,
            overwrite: false,
            threshold: DEFAULT_ZSCORE_THRESHOLD,
            output_dir: DEFAULT_OUTPUT_DIR.into(),
            coalesce: false,
        }
    }
}

impl ZScoreConfig {
    /// A [`ZScoreContext`] with these options.
    pub fn context(&self, draw_progress: bool) -> ZScoreContext {
        let mut builder = ZScoreContextBuilder::default();
        builder
            .data_column(self.data_column)
            .masked(self.masked)
            .overwrite(self.overwrite)
            .draw_progress(draw_progress);
        // every field has a default
        builder.build().unwrap_or_default()
    }
}

/// Options for MAD clipping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MadClipConfig {
    /// Clip beyond this many MADs from the median
    pub nsig: f64,
    /// Compute statistics separately for each spectral window
    pub per_spw: bool,
    /// Only clip these fields, by name or FIELD_ID. All fields if `None`.
    pub fields: Option<Vec<String>>,
}

impl Default for MadClipConfig {
    fn default() -> Self {
        Self {
            nsig: DEFAULT_MADCLIP_NSIG,
            per_spw: true,
            fields: None,
        }
    }
}

/// One manual or a-priori flag. Each selection narrows what is flagged;
/// omitted selections match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManualFlag {
    /// Why the data is bad, for logs
    pub reason: String,
    /// Flag baselines with either antenna in this list (antenna indices)
    #[serde(default)]
    pub antennas: Vec<usize>,
    /// CASA time range, `YYYY/MM/DD/hh:mm:ss~YYYY/MM/DD/hh:mm:ss` (UTC)
    #[serde(default)]
    pub timerange: Option<String>,
    /// CASA spectral window selection, e.g. `0:0~3,2`
    #[serde(default)]
    pub spw: Option<String>,
}

/// Options for deterministic flagging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetFlagsConfig {
    /// Flag visibilities which are exactly zero
    pub clip_zeros: bool,
    /// Flag this many seconds at the start of each scan
    pub quack_s: f64,
    /// Flag this many channels at each edge of every spectral window
    pub edge_chans: usize,
    /// A-priori and manual flags
    pub manual: Vec<ManualFlag>,
}

impl Default for DetFlagsConfig {
    fn default() -> Self {
        Self {
            clip_zeros: true,
            quack_s: 0.0,
            edge_chans: 0,
            manual: vec![],
        }
    }
}

/// All pipeline options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Z-score options
    pub zscore: ZScoreConfig,
    /// MAD clipping options
    pub madclip: MadClipConfig,
    /// Deterministic flagging options
    pub detflags: DetFlagsConfig,
}

fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field: field.into(),
            value: value.to_string(),
            reason: "must be a positive, finite number".into(),
        })
    }
}

impl PipelineConfig {
    /// Parse and validate YAML from `reader`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] for malformed YAML or unknown fields, and
    /// [`ConfigError::Invalid`] for values that fail [`PipelineConfig::validate`].
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// As [`PipelineConfig::from_reader`], plus [`ConfigError::Read`] if the
    /// file can't be opened.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("reading config {}", path.display());
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file))
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first unusable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("zscore.threshold", self.zscore.threshold)?;
        positive("madclip.nsig", self.madclip.nsig)?;
        if self.zscore.output_dir.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "zscore.output_dir".into(),
                value: format!("{:?}", self.zscore.output_dir),
                reason: "must not be empty".into(),
            });
        }
        if matches!(&self.madclip.fields, Some(fields) if fields.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "madclip.fields".into(),
                value: "[]".into(),
                reason: "must name at least one field, or be omitted".into(),
            });
        }
        let quack_s = self.detflags.quack_s;
        if !(quack_s.is_finite() && quack_s >= 0.0) {
            return Err(ConfigError::Invalid {
                field: "detflags.quack_s".into(),
                value: quack_s.to_string(),
                reason: "must be a finite number of seconds, zero to disable".into(),
            });
        }
        for (idx, flag) in self.detflags.manual.iter().enumerate() {
            FlagSelection::parse(flag).map_err(|e| ConfigError::Invalid {
                field: format!("detflags.manual[{idx}]"),
                value: flag.reason.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
