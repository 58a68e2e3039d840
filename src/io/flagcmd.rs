//! Write flag ranges as a CASA `flagdata(mode='list')` command file.

use std::{
    fs::{create_dir_all, File},
    io::{BufWriter, Write},
    path::Path,
};

use log::{debug, trace};

use crate::{flag_ranges::FlagRange, io::error::IOError};

/// The flag command for a single range.
pub fn flag_command(range: &FlagRange, reason: &str) -> String {
    format!(
        "mode='manual' spw='{}' timerange='{}' reason='{}'",
        range.casa_spw(),
        range.casa_timerange(),
        reason.replace('\'', "")
    )
}

/// Write one command per range to `path`, replacing any existing file.
/// Returns the number of commands written.
///
/// # Errors
///
/// Returns [`IOError::StdIO`] if the file can't be written.
pub fn write_flag_commands(
    path: &Path,
    ranges: &[FlagRange],
    reason: &str,
) -> Result<usize, IOError> {
    trace!("start write_flag_commands");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for range in ranges {
        writeln!(writer, "{}", flag_command(range, reason))?;
    }
    writer.flush()?;
    debug!("wrote {} flag commands to {}", ranges.len(), path.display());
    Ok(ranges.len())
}
