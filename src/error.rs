//! Errors that can occur in vlaflag

use thiserror::Error;

use crate::{
    config::ConfigError, detflags::DetFlagError, io::error::IOError, zscore::ZScoreError,
};

#[derive(Error, Debug)]
/// Errors that can occur in the command line interface
pub enum CLIError {
    #[error("Invalid Command Line Argument {option}\nExpected {expected}, received {received}")]
    /// When a bad value is provided to a command line argument
    InvalidCommandLineArgument {
        /// The option for which the value was provided
        option: String,
        /// The values which are expected for this option
        expected: String,
        /// The value which was received
        received: String,
    },
}

#[derive(Error, Debug)]
/// All the errors that can occur in vlaflag
pub enum VlaFlagError {
    #[error(transparent)]
    /// Error derived from [`ZScoreError`]
    ZScoreError(#[from] ZScoreError),

    #[error(transparent)]
    /// Error derived from [`IOError`]
    IOError(#[from] IOError),

    #[error(transparent)]
    /// Error derived from [`DetFlagError`]
    DetFlagError(#[from] DetFlagError),

    #[error(transparent)]
    /// Error derived from [`ConfigError`]
    ConfigError(#[from] ConfigError),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    /// Error derived from [`clap::Error`]
    ClapError(#[from] clap::Error),

    #[error(transparent)]
    /// Error derived from [`CLIError`]
    CLIError(#[from] CLIError),

    #[error("Dry run")]
    /// The user asked for a summary only, nothing was processed.
    DryRun {},
}
