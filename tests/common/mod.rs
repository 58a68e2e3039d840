use std::cell::Cell;

use vlaflag::{
    c32,
    marlu::hifitime::Epoch,
    ndarray::{s, Array4},
    DataColumn, IOError, ScanSegmentation, VisCube, VisReader,
};

/// Amplitudes stepping through ten values in [0.9, 1.1] along time, with a
/// spike of 100 at `spike` = (timestep, channel) on every baseline.
pub fn cube_with_spike(
    num_baselines: usize,
    scans: &[usize],
    num_freqs: usize,
    chans_per_spw: usize,
    spike: Option<(usize, usize)>,
) -> VisCube {
    let num_times: usize = scans.iter().sum();
    let mut vis = Array4::from_shape_fn(
        (2, num_baselines, num_times, num_freqs),
        |(_, bl, t, f)| {
            let step = ((t + 3 * f) % 10) as f32 - 4.5;
            c32::new(1.0 + 0.1 * step / 4.5 + 0.001 * bl as f32, 0.0)
        },
    );
    if let Some((t, f)) = spike {
        vis.slice_mut(s![.., .., t, f]).fill(c32::new(100.0, 0.0));
    }
    VisCube {
        flags: Array4::from_elem(vis.dim(), false),
        vis,
        freqs_hz: (0..num_freqs).map(|f| 3.0e9 + 1.0e6 * f as f64).collect(),
        chans_per_spw,
        integration_time_s: 5.0,
        timestamps: (0..num_times)
            .map(|t| Epoch::from_gpst_seconds(1_300_000_000.0 + 5.0 * t as f64))
            .collect(),
        ant_pairs: (0..num_baselines).map(|bl| (0, bl + 1)).collect(),
        scans: Some(ScanSegmentation::new(scans.to_vec()).unwrap()),
        field_ids: None,
    }
}

/// Serves a fixed cube, counting reads.
pub struct MemReader {
    pub cube: VisCube,
    pub reads: Cell<usize>,
}

impl MemReader {
    pub fn new(cube: VisCube) -> Self {
        Self {
            cube,
            reads: Cell::new(0),
        }
    }
}

impl VisReader for MemReader {
    fn read_vis(&self, _data_column: DataColumn) -> Result<VisCube, IOError> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.cube.clone())
    }

    fn identity(&self) -> String {
        "memory".into()
    }
}
