//! Synthetic visibility cubes shared by unit tests.

use crate::{
    marlu::{c32, hifitime::Epoch},
    ndarray::{s, Array4},
    segments::ScanSegmentation,
    vis::VisCube,
};

/// GPS time of the first test timestep
pub(crate) const TEST_START_GPS_S: f64 = 1_253_300_000.0;

/// Integration time of the test cubes
pub(crate) const TEST_INT_TIME_S: f64 = 2.0;

/// `num_times` timestamps, [`TEST_INT_TIME_S`] apart.
pub(crate) fn test_timestamps(num_times: usize) -> Vec<Epoch> {
    (0..num_times)
        .map(|t| Epoch::from_gpst_seconds(TEST_START_GPS_S + TEST_INT_TIME_S * t as f64))
        .collect()
}

/// A cube with amplitudes close to one and no flags.
///
/// Along time, the amplitude of each channel steps through ten evenly spaced
/// values in [0.9, 1.1], so any ten consecutive timesteps hold each value once
/// and no series is constant. Baselines differ only by a small constant
/// offset, so the mean over baselines has the same shape.
pub(crate) fn synthetic_cube(
    num_pols: usize,
    num_baselines: usize,
    num_times: usize,
    num_freqs: usize,
    chans_per_spw: usize,
) -> VisCube {
    let vis = Array4::from_shape_fn(
        (num_pols, num_baselines, num_times, num_freqs),
        |(_, bl, t, f)| {
            let step = ((t + 3 * f) % 10) as f32 - 4.5;
            c32::new(1.0 + 0.1 * step / 4.5 + 0.001 * bl as f32, 0.0)
        },
    );
    let mut ant_pairs = vec![];
    let mut ant1 = 0;
    while ant_pairs.len() < num_baselines {
        ant1 += 1;
        for ant2 in 0..ant1 {
            if ant_pairs.len() < num_baselines {
                ant_pairs.push((ant2, ant1));
            }
        }
    }
    VisCube {
        flags: Array4::from_elem(vis.dim(), false),
        vis,
        freqs_hz: (0..num_freqs).map(|f| 1.0e9 + 2.0e6 * f as f64).collect(),
        chans_per_spw,
        integration_time_s: TEST_INT_TIME_S,
        timestamps: test_timestamps(num_times),
        ant_pairs,
        scans: None,
        field_ids: None,
    }
}

/// Two polarizations, ten baselines and 64 channels over two scans of ten
/// timesteps, with an amplitude of 100 at timestep 15, channel 32 on every
/// baseline and polarization.
pub(crate) fn spike_cube() -> VisCube {
    let mut cube = synthetic_cube(2, 10, 20, 64, 64);
    cube.scans = Some(ScanSegmentation::new(vec![10, 10]).unwrap());
    cube.vis
        .slice_mut(s![.., .., 15, 32])
        .fill(c32::new(100.0, 0.0));
    cube
}
