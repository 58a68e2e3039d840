//! Scan segmentation of the time axis.
//!
//! Robust statistics are computed independently within each scan, so the
//! time axis is partitioned into contiguous, non-overlapping segments whose
//! lengths must add up to exactly the number of timesteps.

use std::{fmt::Display, ops::Range};

use itertools::Itertools;

use crate::zscore::ZScoreError;

/// An ordered list of scan lengths (in timesteps) which partitions the time axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSegmentation {
    lengths: Vec<usize>,
}

impl ScanSegmentation {
    /// Create a segmentation from scan lengths.
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError::BadSegmentation`] if there are no segments or
    /// if any segment is empty.
    pub fn new(lengths: Vec<usize>) -> Result<Self, ZScoreError> {
        if lengths.is_empty() || lengths.contains(&0) {
            return Err(ZScoreError::BadSegmentation {
                lengths,
                reason: "segments must be non-empty".into(),
            });
        }
        Ok(Self { lengths })
    }

    /// A single segment spanning all `num_timesteps`.
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError::BadSegmentation`] if `num_timesteps` is zero.
    pub fn whole(num_timesteps: usize) -> Result<Self, ZScoreError> {
        Self::new(vec![num_timesteps])
    }

    /// Derive a segmentation from the scan number of each timestep. Each run of
    /// consecutive equal scan numbers is one segment.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use vlaflag::segments::ScanSegmentation;
    ///
    /// let segs = ScanSegmentation::from_scan_numbers(&[1, 1, 1, 2, 2, 4]).unwrap();
    /// assert_eq!(segs.lengths(), &[3, 2, 1]);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError::BadSegmentation`] if `scan_numbers` is empty.
    pub fn from_scan_numbers(scan_numbers: &[i32]) -> Result<Self, ZScoreError> {
        let lengths = scan_numbers
            .iter()
            .dedup_with_count()
            .map(|(count, _)| count)
            .collect();
        Self::new(lengths)
    }

    /// The length of each segment, in timesteps.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// The number of segments.
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// Always false, a segmentation has at least one segment.
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// The total number of timesteps covered.
    pub fn num_timesteps(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Check that the segments cover exactly `num_timesteps`.
    ///
    /// # Errors
    ///
    /// Returns [`ZScoreError::BadSegmentation`] on a mismatch. The result is
    /// never silently truncated.
    pub fn validate(&self, num_timesteps: usize) -> Result<(), ZScoreError> {
        let total = self.num_timesteps();
        if total != num_timesteps {
            return Err(ZScoreError::BadSegmentation {
                lengths: self.lengths.clone(),
                reason: format!(
                    "segment lengths sum to {total}, but there are {num_timesteps} timesteps"
                ),
            });
        }
        Ok(())
    }

    /// The timestep index range of each segment, in order.
    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.lengths.iter().scan(0, |start, &len| {
            let range = *start..*start + len;
            *start += len;
            Some(range)
        })
    }
}

impl Display for ScanSegmentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.lengths.iter().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_contiguous() {
        let segs = ScanSegmentation::new(vec![3, 1, 4]).unwrap();
        assert_eq!(segs.ranges().collect::<Vec<_>>(), vec![0..3, 3..4, 4..8]);
        assert_eq!(segs.num_timesteps(), 8);
        assert!(segs.validate(8).is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatch() {
        let segs = ScanSegmentation::new(vec![10, 10]).unwrap();
        assert!(matches!(
            segs.validate(19),
            Err(ZScoreError::BadSegmentation { .. })
        ));
        assert!(matches!(
            segs.validate(21),
            Err(ZScoreError::BadSegmentation { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(ScanSegmentation::new(vec![]).is_err());
        assert!(ScanSegmentation::new(vec![3, 0, 2]).is_err());
        assert!(ScanSegmentation::whole(0).is_err());
        assert!(ScanSegmentation::from_scan_numbers(&[]).is_err());
    }

    #[test]
    fn test_repeated_scan_number_later_is_new_segment() {
        let segs = ScanSegmentation::from_scan_numbers(&[7, 7, 8, 7]).unwrap();
        assert_eq!(segs.lengths(), &[2, 1, 1]);
        assert_eq!(format!("{segs}"), "[2, 1, 1]");
    }
}
