#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! vlaflag finds radio frequency interference in Very Large Array measurement
//! sets with a modified Z-score, and flags it.
//!
//! # Examples
//!
//! Here's an example of how to compute, cache and apply Z-score flags
//!
//! ```rust,no_run
//! use std::path::Path;
//! use vlaflag::{compute_zscore, flag_from_zscore, DataColumn};
//!
//! let ms = Path::new("/data/19A-001.ms");
//!
//! // cached as /data/output/19A-001/z_score_corrected.fits, reused on later runs
//! let cache_path = compute_zscore(ms, DataColumn::Corrected, true, false)?;
//! println!("cached {}", cache_path.display());
//!
//! // flag every channel and timestep (±1 integration) where |z| > 5
//! let applied = flag_from_zscore(ms, 5.0)?;
//! println!("applied {applied} flag ranges");
//! # Ok::<(), vlaflag::VlaFlagError>(())
//! ```
//!
//! # Details
//!
//! For each polarization, baseline and channel, visibility amplitudes are
//! compared to the median of their scan, in units of the median absolute
//! deviation scaled to a Gaussian standard deviation. Averaging this over
//! polarizations and baselines gives a `(time, frequency)` Z-score, and
//! elements above a threshold become [`FlagRange`]s. Measurement sets are read
//! and written through casacore with [`marlu::rubbl_casatables`], and Z-scores
//! are cached as FITS with [`marlu::fitsio`].

pub use marlu;
pub use marlu::{c32, ndarray, Complex};

pub mod constants;

pub mod error;
pub use error::{CLIError, VlaFlagError};

pub mod stats;
pub use stats::RobustStats;

pub mod segments;
pub use segments::ScanSegmentation;

pub mod vis;
pub use vis::{DataColumn, FlagWriter, VisCube, VisReader};

pub mod zscore;
pub use zscore::{ZScoreContext, ZScoreContextBuilder, ZScoreCube, ZScoreError};

pub mod flag_ranges;
pub use flag_ranges::{coalesce_flag_ranges, flag_ranges, FlagRange, FlagRanges};

pub mod clip;
pub use clip::{mad_clip, ClipStats};

pub mod detflags;
pub use detflags::{det_flags, DetFlagError, DetFlagStats};

pub mod io;
pub use io::{IOError, MeasurementSetReader};

pub mod config;
pub use config::{ConfigError, PipelineConfig};

pub mod pipeline;
pub use pipeline::{compute_zscore, det_flags_ms, flag_from_zscore, mad_clip_ms};

#[cfg(feature = "cli")]
pub mod cli;

pub(crate) mod util;

#[cfg(test)]
pub(crate) mod test_common;
