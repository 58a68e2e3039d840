//! Errors that can occur in the io module

use std::path::PathBuf;

use marlu::{fitsio, rubbl_casatables};
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur in file io operations
pub enum IOError {
    /// The measurement set doesn't exist.
    #[error("Supplied measurement set {0} does not exist or is not readable!")]
    BadFile(PathBuf),

    /// The main table had nothing in it.
    #[error("The main table of the measurement set {0} contains no rows!")]
    MainTableEmpty(PathBuf),

    /// A column that is needed for the selected data column is missing.
    #[error("The measurement set has no {col} column")]
    NoDataCol {
        /// The name of the missing column
        col: String,
    },

    /// The measurement set has no parallel-hand correlations.
    #[error("The POLARIZATION table has no parallel hand correlations (found {found:?})")]
    NoParallelHands {
        /// The corr types which were found
        found: Vec<i32>,
    },

    /// The spectral windows can't be stacked on one frequency axis.
    #[error("Spectral windows must have equal channel counts (expected {expected}, found {found} in spw {spw})")]
    UnequalSpectralWindows {
        /// The spectral window which disagreed
        spw: usize,
        /// The channel count of the first spectral window
        expected: usize,
        /// The channel count which was found
        found: usize,
    },

    /// Error to describe some kind of inconsistent state within a measurement set.
    #[error("Inconsistent measurement set (table: {table}, expected: {expected}, found: {found})")]
    MsInconsistent {
        /// The table where the inconsistency was found
        table: String,
        /// The value that was expected
        expected: String,
        /// The unexpected value that was found
        found: String,
    },

    /// The cache file exists, but was written with a different layout.
    #[error("Z-score cache {path} has schema version {found:?}, expected {expected}. Recompute with --overwrite")]
    CacheSchemaMismatch {
        /// The path to the cache file
        path: PathBuf,
        /// The schema version this build understands
        expected: i64,
        /// The schema version in the file, if any
        found: Option<i64>,
    },

    /// The cache file has an HDU of an unexpected shape or kind.
    #[error("Z-score cache {path} HDU {hdu}: {reason}")]
    CacheInconsistent {
        /// The path to the cache file
        path: PathBuf,
        /// The HDU which was malformed
        hdu: String,
        /// What was wrong with it
        reason: String,
    },

    /// A cached Z-score doesn't belong to the measurement set it would flag.
    #[error("Z-score cache doesn't match measurement set {ms}: {what} expected {expected}, found {found}. Recompute with --overwrite")]
    ZScoreMismatch {
        /// The measurement set
        ms: PathBuf,
        /// What disagreed
        what: String,
        /// The value from the measurement set
        expected: String,
        /// The value from the cache
        found: String,
    },

    /// A field selection names a field the measurement set doesn't have.
    #[error("No field {field} in measurement set, which has {available:?}")]
    UnknownField {
        /// The requested field name or id
        field: String,
        /// The names of the fields in the FIELD table
        available: Vec<String>,
    },

    /// Error when opening or interacting with a fits file.
    #[error("{fits_filename}: {fits_error}")]
    FitsIO {
        /// The [`fitsio::errors::Error`]
        fits_error: fitsio::errors::Error,
        /// The filename of the fits file where the error occurred
        fits_filename: PathBuf,
    },

    #[error("Error when trying to interface with measurement set: {0}")]
    /// Error derived from [`rubbl_casatables::TableError`]
    Table(#[from] rubbl_casatables::TableError),

    #[error("Error from casacore: {0}")]
    /// Error derived from [`rubbl_casatables::CasacoreError`]
    Casacore(#[from] rubbl_casatables::CasacoreError),

    #[error(transparent)]
    /// Error derived from [`std::io::Error`]
    StdIO(#[from] std::io::Error),
}
