// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.
//!
//! All floating point constants *must* be double precision.

/// Scale factor which turns a median absolute deviation into an estimate of
/// the standard deviation of normally distributed data.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Any Z-score threshold at or above this value disables flagging entirely.
pub const DISABLE_THRESHOLD: f64 = 1e6;

/// The Z-score threshold used when none is configured.
pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 5.0;

/// The number of MADs outside of which `madclip` flags when none is configured.
pub const DEFAULT_MADCLIP_NSIG: f64 = 4.0;

/// Directory (relative to the parent of the measurement set) holding cache files.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Version of the Z-score cache file layout. Bump whenever HDUs or keys change.
pub const CACHE_SCHEMA_VERSION: i64 = 2;

/// The reason recorded against Z-score flag commands.
pub const ZSCORE_FLAG_REASON: &str = "Z-score";

/// casacore stores times as seconds since the MJD epoch; hifitime counts UTC
/// seconds from 1900. Add this to hifitime UTC seconds to get casacore time.
pub const CASACORE_TIME_OFFSET_S: f64 =
    marlu::hifitime::J1900_OFFSET * marlu::hifitime::SECONDS_PER_DAY;

/// casacore Stokes enumeration values for the parallel hand correlations.
///
/// See `casacore::Stokes::StokesTypes`: 5=RR, 8=LL, 9=XX, 12=YY.
pub const PARALLEL_HAND_CORR_TYPES: [i32; 4] = [5, 8, 9, 12];
