//! Input and output: measurement sets, the Z-score cache and flag command files.

pub mod cache;
pub mod error;
pub mod flagcmd;
pub mod ms;

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use crate::vis::DataColumn;

pub use self::{
    cache::{read_zscore_cache, write_zscore_cache},
    error::IOError,
    flagcmd::write_flag_commands,
    ms::MeasurementSetReader,
};

/// Where the Z-score of `data_column` is cached for the measurement set at
/// `ms_path`: `<ms parent>/<output_dir>/<ms stem>/z_score_<column>.fits`, so
/// measurement sets sharing a directory get separate caches.
///
/// # Examples
///
/// ```rust
/// use std::path::Path;
/// use vlaflag::{io::zscore_cache_path, vis::DataColumn};
///
/// assert_eq!(
///     zscore_cache_path(Path::new("/data/obs.ms"), "output", DataColumn::Corrected),
///     Path::new("/data/output/obs/z_score_corrected.fits"),
/// );
/// ```
pub fn zscore_cache_path(ms_path: &Path, output_dir: &str, data_column: DataColumn) -> PathBuf {
    let ms_stem = ms_path.file_stem().unwrap_or_else(|| OsStr::new("ms"));
    ms_path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(output_dir)
        .join(ms_stem)
        .join(format!("z_score_{data_column}.fits"))
}
