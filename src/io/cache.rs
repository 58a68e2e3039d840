// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Read and write the modified Z-score cache, a FITS file of named image HDUs.
//!
//! | HDU                | type | shape                               |
//! |--------------------|------|-------------------------------------|
//! | `ZSCORE`           | f64  | (pol, baseline, time, freq)         |
//! | `ZSCORE_FLAGS`     | u8   | (pol, baseline, time, freq)         |
//! | `ZSCORE_AVG`       | f64  | (time, freq)                        |
//! | `ZSCORE_AVG_FLAGS` | u8   | (time, freq)                        |
//! | `FREQS`            | f64  | (freq), Hz                          |
//! | `TIMES`            | f64  | (time), MJD UTC seconds             |
//! | `ANT_PAIRS`        | i32  | (baseline, 2)                       |
//! | `SCAN_LENGTHS`     | i32  | (scan)                              |
//! | `SOURCE`           | u8   | (bytes), UTF-8, optional            |
//!
//! The primary HDU carries `VFSCHEMA`, `INTTIME`, `CHANSPW`, `DATACOL` and
//! `MASKED` keys. `SOURCE` names the dataset the Z-score was computed from;
//! it is an image rather than a key since paths outgrow FITS header values.

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    constants::{CACHE_SCHEMA_VERSION, CASACORE_TIME_OFFSET_S},
    io::error::IOError,
    marlu::{
        fitsio::{
            errors::Error as FitsError,
            hdu::HduInfo,
            headers::ReadsKey,
            images::{ImageDescription, ImageType, ReadImage, WriteImage},
            FitsFile,
        },
        hifitime::Epoch,
    },
    ndarray::{Array2, Array4, ArrayView, Dimension},
    segments::ScanSegmentation,
    vis::DataColumn,
    zscore::ZScoreCube,
};

fn write_image_hdu<T: WriteImage>(
    fptr: &mut FitsFile,
    name: &str,
    data_type: ImageType,
    shape: &[usize],
    data: &[T],
) -> Result<(), FitsError> {
    let image_description = ImageDescription {
        data_type,
        dimensions: shape,
    };
    let hdu = fptr.create_image(name.to_string(), &image_description)?;
    hdu.write_image(fptr, data)?;
    Ok(())
}

fn flags_to_u8<D: Dimension>(flags: ArrayView<bool, D>) -> Vec<u8> {
    flags.iter().map(|&flag| u8::from(flag)).collect()
}

/// Write `zscore` to a new cache file at `path`, replacing any file there and
/// creating missing parent directories.
///
/// # Errors
///
/// Returns [`IOError::FitsIO`] or [`IOError::StdIO`] if the file can't be written.
pub fn write_zscore_cache(zscore: &ZScoreCube, path: &Path) -> Result<(), IOError> {
    trace!("start write_zscore_cache");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }
    let fits_err = |fits_error: FitsError| IOError::FitsIO {
        fits_error,
        fits_filename: path.to_path_buf(),
    };

    let mut fptr = FitsFile::create(path)
        .overwrite()
        .open()
        .map_err(fits_err)?;
    let hdu = fptr.hdu(0).map_err(fits_err)?;
    hdu.write_key(&mut fptr, "VFSCHEMA", CACHE_SCHEMA_VERSION)
        .map_err(fits_err)?;
    hdu.write_key(&mut fptr, "INTTIME", zscore.integration_time_s)
        .map_err(fits_err)?;
    hdu.write_key(&mut fptr, "CHANSPW", zscore.chans_per_spw as i64)
        .map_err(fits_err)?;
    hdu.write_key(&mut fptr, "DATACOL", zscore.data_column.as_str())
        .map_err(fits_err)?;
    hdu.write_key(&mut fptr, "MASKED", i64::from(zscore.masked))
        .map_err(fits_err)?;
    hdu.write_key(
        &mut fptr,
        "SOFTWARE",
        format!(
            "Created by {} v{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
    )
    .map_err(fits_err)?;

    let shape = zscore.zscore.shape().to_vec();
    let zscore_data: Vec<f64> = zscore.zscore.iter().copied().collect();
    write_image_hdu(&mut fptr, "ZSCORE", ImageType::Double, &shape, &zscore_data)
        .map_err(fits_err)?;
    write_image_hdu(
        &mut fptr,
        "ZSCORE_FLAGS",
        ImageType::UnsignedByte,
        &shape,
        &flags_to_u8(zscore.mask.view()),
    )
    .map_err(fits_err)?;

    let avg_shape = zscore.zscore_avg.shape().to_vec();
    let avg_data: Vec<f64> = zscore.zscore_avg.iter().copied().collect();
    write_image_hdu(&mut fptr, "ZSCORE_AVG", ImageType::Double, &avg_shape, &avg_data)
        .map_err(fits_err)?;
    write_image_hdu(
        &mut fptr,
        "ZSCORE_AVG_FLAGS",
        ImageType::UnsignedByte,
        &avg_shape,
        &flags_to_u8(zscore.mask_avg.view()),
    )
    .map_err(fits_err)?;

    write_image_hdu(
        &mut fptr,
        "FREQS",
        ImageType::Double,
        &[zscore.freqs_hz.len()],
        &zscore.freqs_hz,
    )
    .map_err(fits_err)?;
    let times: Vec<f64> = zscore
        .timestamps
        .iter()
        .map(|epoch| epoch.to_utc_seconds() + CASACORE_TIME_OFFSET_S)
        .collect();
    write_image_hdu(&mut fptr, "TIMES", ImageType::Double, &[times.len()], &times)
        .map_err(fits_err)?;
    let ant_pairs: Vec<i32> = zscore
        .ant_pairs
        .iter()
        .flat_map(|&(ant1, ant2)| [ant1 as i32, ant2 as i32])
        .collect();
    write_image_hdu(
        &mut fptr,
        "ANT_PAIRS",
        ImageType::Long,
        &[zscore.ant_pairs.len(), 2],
        &ant_pairs,
    )
    .map_err(fits_err)?;
    let scan_lengths: Vec<i32> = zscore
        .scans
        .lengths()
        .iter()
        .map(|&len| len as i32)
        .collect();
    write_image_hdu(
        &mut fptr,
        "SCAN_LENGTHS",
        ImageType::Long,
        &[scan_lengths.len()],
        &scan_lengths,
    )
    .map_err(fits_err)?;
    if let Some(source) = zscore.source.as_ref().filter(|source| !source.is_empty()) {
        write_image_hdu(
            &mut fptr,
            "SOURCE",
            ImageType::UnsignedByte,
            &[source.len()],
            source.as_bytes(),
        )
        .map_err(fits_err)?;
    }

    debug!(
        "wrote modified Z-score cache {} with shape {:?}",
        path.display(),
        shape
    );
    trace!("end write_zscore_cache");
    Ok(())
}

/// Reads named image HDUs of one cache file, tagging errors with its path.
struct CacheReader {
    fptr: FitsFile,
    path: PathBuf,
}

impl CacheReader {
    fn fits_err(&self, fits_error: FitsError) -> IOError {
        IOError::FitsIO {
            fits_error,
            fits_filename: self.path.clone(),
        }
    }

    fn inconsistent(&self, hdu: &str, reason: String) -> IOError {
        IOError::CacheInconsistent {
            path: self.path.clone(),
            hdu: hdu.into(),
            reason,
        }
    }

    fn primary_key<T: ReadsKey>(&mut self, key: &str) -> Result<T, IOError> {
        let hdu = self.fptr.hdu(0).map_err(|e| self.fits_err(e))?;
        hdu.read_key(&mut self.fptr, key)
            .map_err(|e| self.fits_err(e))
    }

    /// Read the image HDU `name`, along with its shape.
    fn image<T>(&mut self, name: &str) -> Result<(Vec<usize>, Vec<T>), IOError>
    where
        Vec<T>: ReadImage,
    {
        let hdu = self.fptr.hdu(name).map_err(|e| self.fits_err(e))?;
        let shape = match &hdu.info {
            HduInfo::ImageInfo { shape, .. } => shape.clone(),
            _ => return Err(self.inconsistent(name, "not an image".into())),
        };
        let data: Vec<T> = hdu
            .read_image(&mut self.fptr)
            .map_err(|e| self.fits_err(e))?;
        Ok((shape, data))
    }

    fn image_1d<T>(&mut self, name: &str) -> Result<Vec<T>, IOError>
    where
        Vec<T>: ReadImage,
    {
        let (shape, data) = self.image(name)?;
        if shape.len() != 1 {
            return Err(self.inconsistent(name, format!("expected 1 axis, found {shape:?}")));
        }
        Ok(data)
    }

    fn image_2d<T>(&mut self, name: &str) -> Result<Array2<T>, IOError>
    where
        Vec<T>: ReadImage,
    {
        let (shape, data) = self.image(name)?;
        match shape[..] {
            [rows, cols] => Array2::from_shape_vec((rows, cols), data)
                .map_err(|e| self.inconsistent(name, e.to_string())),
            _ => Err(self.inconsistent(name, format!("expected 2 axes, found {shape:?}"))),
        }
    }

    fn image_4d<T>(&mut self, name: &str) -> Result<Array4<T>, IOError>
    where
        Vec<T>: ReadImage,
    {
        let (shape, data) = self.image(name)?;
        match shape[..] {
            [a, b, c, d] => Array4::from_shape_vec((a, b, c, d), data)
                .map_err(|e| self.inconsistent(name, e.to_string())),
            _ => Err(self.inconsistent(name, format!("expected 4 axes, found {shape:?}"))),
        }
    }
}

/// Read a cache file written by [`write_zscore_cache`].
///
/// # Errors
///
/// Returns [`IOError::CacheSchemaMismatch`] if the file was written with a
/// different layout, [`IOError::CacheInconsistent`] if its HDUs disagree on
/// their shapes, or [`IOError::FitsIO`] if it can't be read.
pub fn read_zscore_cache(path: &Path) -> Result<ZScoreCube, IOError> {
    trace!("start read_zscore_cache");
    let fptr = FitsFile::open(path).map_err(|fits_error| IOError::FitsIO {
        fits_error,
        fits_filename: path.to_path_buf(),
    })?;
    let mut reader = CacheReader {
        fptr,
        path: path.to_path_buf(),
    };

    let schema: Option<i64> = reader.primary_key("VFSCHEMA").ok();
    if schema != Some(CACHE_SCHEMA_VERSION) {
        return Err(IOError::CacheSchemaMismatch {
            path: path.to_path_buf(),
            expected: CACHE_SCHEMA_VERSION,
            found: schema,
        });
    }
    let integration_time_s: f64 = reader.primary_key("INTTIME")?;
    let chans_per_spw: i64 = reader.primary_key("CHANSPW")?;
    let data_column: String = reader.primary_key("DATACOL")?;
    let data_column: DataColumn = data_column
        .parse()
        .map_err(|e| reader.inconsistent("PRIMARY", e))?;
    let masked: i64 = reader.primary_key("MASKED")?;

    let zscore: Array4<f64> = reader.image_4d("ZSCORE")?;
    let mask = reader.image_4d::<u8>("ZSCORE_FLAGS")?.mapv(|flag| flag != 0);
    let zscore_avg: Array2<f64> = reader.image_2d("ZSCORE_AVG")?;
    let mask_avg = reader
        .image_2d::<u8>("ZSCORE_AVG_FLAGS")?
        .mapv(|flag| flag != 0);
    let freqs_hz: Vec<f64> = reader.image_1d("FREQS")?;
    let timestamps: Vec<Epoch> = reader
        .image_1d::<f64>("TIMES")?
        .into_iter()
        .map(|time| Epoch::from_utc_seconds(time - CASACORE_TIME_OFFSET_S))
        .collect();
    let ant_pairs = reader
        .image_2d::<i32>("ANT_PAIRS")?
        .outer_iter()
        .map(|pair| (pair[0] as usize, pair[1] as usize))
        .collect::<Vec<_>>();
    let scan_lengths: Vec<usize> = reader
        .image_1d::<i32>("SCAN_LENGTHS")?
        .into_iter()
        .map(|len| len.max(0) as usize)
        .collect();
    let scans = ScanSegmentation::new(scan_lengths)
        .map_err(|e| reader.inconsistent("SCAN_LENGTHS", e.to_string()))?;
    let source = match reader.image_1d::<u8>("SOURCE") {
        Ok(bytes) => Some(
            String::from_utf8(bytes).map_err(|e| reader.inconsistent("SOURCE", e.to_string()))?,
        ),
        Err(_) => None,
    };

    let (_, num_baselines, num_times, num_freqs) = zscore.dim();
    let checks = [
        ("ZSCORE_FLAGS", mask.dim() == zscore.dim()),
        ("ZSCORE_AVG", zscore_avg.dim() == (num_times, num_freqs)),
        ("ZSCORE_AVG_FLAGS", mask_avg.dim() == zscore_avg.dim()),
        ("FREQS", freqs_hz.len() == num_freqs),
        ("TIMES", timestamps.len() == num_times),
        ("ANT_PAIRS", ant_pairs.len() == num_baselines),
        ("SCAN_LENGTHS", scans.num_timesteps() == num_times),
        (
            "PRIMARY",
            chans_per_spw > 0 && num_freqs % chans_per_spw as usize == 0,
        ),
    ];
    for (hdu, ok) in checks {
        if !ok {
            return Err(reader.inconsistent(
                hdu,
                format!("disagrees with ZSCORE shape {:?}", zscore.dim()),
            ));
        }
    }

    debug!(
        "read modified Z-score cache {} with shape {:?}",
        path.display(),
        zscore.dim()
    );
    trace!("end read_zscore_cache");
    Ok(ZScoreCube {
        zscore,
        mask,
        zscore_avg,
        mask_avg,
        freqs_hz,
        chans_per_spw: chans_per_spw as usize,
        integration_time_s,
        timestamps,
        ant_pairs,
        scans,
        data_column,
        masked: masked != 0,
        source,
    })
}
